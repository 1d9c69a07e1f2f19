//! Task sequences run end to end with `/bin/sh` tasks.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gridvisor::process::is_alive;
use gridvisor::runtime::{ExitReason, RuntimeOptions, EXIT_ABORTED_BY_CLIENT};
use gridvisor::supervisor::{Outcome, SupervisorOptions, CHECKPOINT_FILE};
use gridvisor::wire::ControlMessage;
use gridvisor::AppError;

use super::test_helpers::{
    job, read_pid, script, sh_task, slot_config, standalone, supervisor, with_client,
    RecordingArchiver,
};

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn full_run_unpacks_runs_in_order_and_packs() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let first = script(slot, "first.sh", "echo one > out_1.dat\necho first >> order.txt");
    let second = script(slot, "second.sh", "echo two > out_2.dat\necho second >> order.txt");
    let job = job(&format!(
        "<unzip_input><zipfilename>in.zip</zipfilename></unzip_input>\
         {}{}\
         <zip_output><zipfilename>results.zip</zipfilename><filename>out_.*</filename></zip_output>",
        sh_task(slot, &first, "<weight>1</weight>"),
        sh_task(slot, &second, "<weight>3</weight>"),
    ));

    let ctx = standalone(slot);
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    let outcome = sup.run().await.unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(outcome.exit_code(), 0);

    assert_eq!(
        std::fs::read_to_string(slot.join("order.txt")).unwrap(),
        "first\nsecond\n"
    );
    assert_eq!(*archiver.unpacked.lock().unwrap(), vec![slot.join("in.zip")]);
    let packed = archiver.packed.lock().unwrap();
    assert_eq!(packed.len(), 1);
    assert_eq!(packed[0].0, slot.join("results.zip"));
    assert_eq!(packed[0].1, vec![slot.join("out_1.dat"), slot.join("out_2.dat")]);

    assert_eq!(sup.committed().tasks_completed, 2);
    let saved = std::fs::read_to_string(slot.join(CHECKPOINT_FILE)).unwrap();
    assert!(saved.starts_with("2 "), "checkpoint was {saved:?}");
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn unmatched_output_patterns_still_complete() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let quiet = script(slot, "quiet.sh", "true");
    let job = job(&format!(
        "{}<zip_output><zipfilename>results.zip</zipfilename><filename>never_.*</filename></zip_output>",
        sh_task(slot, &quiet, ""),
    ));

    let ctx = standalone(slot);
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    assert_eq!(sup.run().await.unwrap(), Outcome::Completed);
    assert!(archiver.packed.lock().unwrap().is_empty());
    assert_eq!(sup.committed().tasks_completed, 1);
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn restart_skips_completed_tasks_and_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    std::fs::write(slot.join(CHECKPOINT_FILE), "1 0.5 1.0\n").unwrap();
    let first = script(slot, "first.sh", "touch first_ran");
    let second = script(slot, "second.sh", "touch second_ran");
    let job = job(&format!(
        "<unzip_input><zipfilename>in.zip</zipfilename></unzip_input>{}{}",
        sh_task(slot, &first, ""),
        sh_task(slot, &second, ""),
    ));

    let ctx = standalone(slot);
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    assert_eq!(sup.run().await.unwrap(), Outcome::Completed);
    assert!(!slot.join("first_ran").exists());
    assert!(slot.join("second_ran").exists());
    assert!(archiver.unpacked.lock().unwrap().is_empty());

    let committed = sup.committed();
    assert_eq!(committed.tasks_completed, 2);
    assert!(committed.cumulative_cpu_time >= 0.5);
    assert!(committed.cumulative_runtime >= 1.0);
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn time_limit_kills_task_and_sequence_continues() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let slow = script(slot, "slow.sh", "exec sleep 30");
    let next = script(slot, "next.sh", "touch next_ran");
    let job = job(&format!(
        "{}{}",
        sh_task(slot, &slow, "<time_limit>0.3</time_limit>"),
        sh_task(slot, &next, ""),
    ));

    let ctx = standalone(slot);
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    let started = Instant::now();
    assert_eq!(sup.run().await.unwrap(), Outcome::Completed);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(slot.join("next_ran").exists());
    assert_eq!(sup.committed().tasks_completed, 2);
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn failing_task_stops_sequence_with_its_code() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let bad = script(slot, "bad.sh", "exit 3");
    let never = script(slot, "never.sh", "touch never_ran");
    let job = job(&format!(
        "{}{}",
        sh_task(slot, &bad, ""),
        sh_task(slot, &never, ""),
    ));

    let ctx = standalone(slot);
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    match sup.run().await {
        Err(AppError::ChildFailed { task, code }) => {
            assert_eq!(task, "/bin/sh");
            assert_eq!(code, Some(3));
        }
        other => panic!("expected child failure, got {other:?}"),
    }
    assert!(!slot.join("never_ran").exists());
    assert!(!slot.join(CHECKPOINT_FILE).exists());
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn missing_executable_is_child_failure() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let job = job("<task><application>/nonexistent/gridvisor-task</application></task>");

    let ctx = standalone(slot);
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    assert!(matches!(
        sup.run().await,
        Err(AppError::ChildFailed { code: None, .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn placeholders_env_passthrough_and_redirects() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let echo = script(slot, "echo.sh", "echo \"$@ $OMP\"\necho oops >&2");
    let job = job(&format!(
        "<task><application>/bin/sh</application>\
         <exec_dir>$PROJECT_DIR</exec_dir>\
         <command_line>{} -n $NTHREADS</command_line>\
         <setenv>OMP=$NTHREADS</setenv>\
         <stdout_filename>echo.out</stdout_filename>\
         <stderr_filename>echo.err</stderr_filename>\
         <append_cmdline_args/></task>",
        echo.display()
    ));

    let ctx = standalone(slot);
    let archiver = Arc::new(RecordingArchiver::default());
    let options = SupervisorOptions {
        nthreads: 4,
        passthrough: vec!["--extra".into()],
        ..SupervisorOptions::default()
    };
    let mut sup = supervisor(&ctx, job, options, &archiver);

    assert_eq!(sup.run().await.unwrap(), Outcome::Completed);
    assert_eq!(
        std::fs::read_to_string(slot.join("echo.out")).unwrap(),
        "-n 4 --extra 4\n"
    );
    assert_eq!(std::fs::read_to_string(slot.join("echo.err")).unwrap(), "oops\n");
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn task_checkpoint_saves_partial_progress() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let body = format!(
        "sleep 0.2\ntouch task.chk\nsleep 0.5\ncp {} seen.txt",
        slot.join(CHECKPOINT_FILE).display()
    );
    let worker = script(slot, "worker.sh", &body);
    let job = job(&sh_task(
        slot,
        &worker,
        "<checkpoint_filename>task.chk</checkpoint_filename>",
    ));

    let ctx = standalone(slot);
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    assert_eq!(sup.run().await.unwrap(), Outcome::Completed);
    let seen = std::fs::read_to_string(slot.join("seen.txt")).unwrap();
    assert!(seen.starts_with("0 "), "partial checkpoint was {seen:?}");
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn cpu_of_finished_stages_is_counted() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let stage = "sh -c 'i=0; while [ $i -lt 300000 ]; do i=$((i+1)); done'";
    let staged = script(slot, "staged.sh", &format!("{stage}\n{stage}\n{stage}"));
    let job = job(&sh_task(slot, &staged, ""));

    let ctx = standalone(slot);
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    let started = Instant::now();
    assert_eq!(sup.run().await.unwrap(), Outcome::Completed);
    let wall = started.elapsed().as_secs_f64();

    let cpu = sup.committed().cumulative_cpu_time;
    assert!(
        cpu >= wall * 0.5,
        "recorded {cpu:.2}s of cpu over {wall:.2}s of busy stages"
    );
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn daemons_are_killed_after_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let daemon = script(slot, "daemon.sh", "echo $$ > daemon.pid\nexec sleep 30");
    let main = script(
        slot,
        "main.sh",
        "while [ ! -s daemon.pid ]; do sleep 0.05; done",
    );
    let job = job(&format!(
        "{}{}",
        sh_task(slot, &daemon, "<daemon/>"),
        sh_task(slot, &main, ""),
    ));

    let ctx = standalone(slot);
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    assert_eq!(sup.run().await.unwrap(), Outcome::Completed);
    let pid = read_pid(&slot.join("daemon.pid"));
    assert!(!is_alive(pid), "daemon {pid} survived");
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn client_quit_stops_task_with_code_zero() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let sleeper = script(slot, "sleeper.sh", "echo $$ > task.pid\nexec sleep 30");
    let job = job(&sh_task(slot, &sleeper, ""));

    let (ctx, client) = with_client(slot_config(slot), RuntimeOptions::supervisor());
    ctx.start_monitor().unwrap();
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    let pid_file = slot.join("task.pid");
    let driver = thread::spawn(move || {
        let pid = read_pid(&pid_file);
        assert!(client.process_control.send(ControlMessage::Quit.as_wire()));
        pid
    });

    let started = Instant::now();
    let outcome = sup.run().await.unwrap();
    let pid = driver.join().unwrap();
    ctx.stop_monitor();

    assert_eq!(outcome, Outcome::Stopped(ExitReason::Quit));
    assert_eq!(outcome.exit_code(), 0);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!is_alive(pid));
    assert!(!slot.join(CHECKPOINT_FILE).exists());
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn client_abort_stops_task_with_abort_code() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let sleeper = script(slot, "sleeper.sh", "echo $$ > task.pid\nexec sleep 30");
    let job = job(&sh_task(slot, &sleeper, ""));

    let (ctx, client) = with_client(slot_config(slot), RuntimeOptions::supervisor());
    ctx.start_monitor().unwrap();
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    let pid_file = slot.join("task.pid");
    let driver = thread::spawn(move || {
        read_pid(&pid_file);
        assert!(client.process_control.send(ControlMessage::Abort.as_wire()));
    });

    let outcome = sup.run().await.unwrap();
    driver.join().unwrap();
    ctx.stop_monitor();

    assert_eq!(outcome, Outcome::Stopped(ExitReason::Abort));
    assert_eq!(outcome.exit_code(), EXIT_ABORTED_BY_CLIENT);
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn client_suspend_and_resume_reach_the_task() {
    use super::test_helpers::{proc_state, send_until, wait_for};

    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let sleeper = script(slot, "sleeper.sh", "echo $$ > task.pid\nexec sleep 30");
    let job = job(&sh_task(slot, &sleeper, ""));

    let (ctx, client) = with_client(slot_config(slot), RuntimeOptions::supervisor());
    ctx.start_monitor().unwrap();
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    let pid_file = slot.join("task.pid");
    let driver = thread::spawn(move || {
        let timeout = Duration::from_secs(5);
        let pid = read_pid(&pid_file);

        send_until(timeout, || client.process_control.send(ControlMessage::Suspend.as_wire()));
        let stopped = wait_for(timeout, || proc_state(pid) == Some('T'));

        send_until(timeout, || client.process_control.send(ControlMessage::Resume.as_wire()));
        let resumed = wait_for(timeout, || proc_state(pid).is_some_and(|s| s != 'T'));

        send_until(timeout, || client.process_control.send(ControlMessage::Quit.as_wire()));
        (stopped, resumed)
    });

    let outcome = sup.run().await.unwrap();
    let (stopped, resumed) = driver.join().unwrap();
    ctx.stop_monitor();

    assert!(stopped, "task never reached the stopped state");
    assert!(resumed, "task never continued");
    assert_eq!(outcome, Outcome::Stopped(ExitReason::Quit));
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn status_reports_weighted_fraction() {
    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path();
    let first = script(slot, "first.sh", "true");
    let second = script(slot, "second.sh", "echo 0.5 > progress\nsleep 30");
    let job = job(&format!(
        "{}{}",
        sh_task(slot, &first, "<weight>1</weight>"),
        sh_task(
            slot,
            &second,
            "<weight>3</weight><fraction_done_filename>progress</fraction_done_filename>"
        ),
    ));

    let (ctx, client) = with_client(slot_config(slot), RuntimeOptions::supervisor());
    ctx.start_monitor().unwrap();
    let archiver = Arc::new(RecordingArchiver::default());
    let mut sup = supervisor(&ctx, job, SupervisorOptions::default(), &archiver);

    let driver = thread::spawn(move || {
        use super::test_helpers::{send_until, wait_for};
        use gridvisor::wire::StatusReport;

        let mut best = 0.0_f64;
        wait_for(Duration::from_secs(10), || {
            if let Some(msg) = client.app_status.receive() {
                best = best.max(StatusReport::parse(&msg).fraction_done);
            }
            (best - 0.625).abs() < 1e-6
        });
        send_until(Duration::from_secs(5), || {
            client.process_control.send(ControlMessage::Quit.as_wire())
        });
        best
    });

    let outcome = sup.run().await.unwrap();
    let best = driver.join().unwrap();
    ctx.stop_monitor();

    assert_eq!(outcome, Outcome::Stopped(ExitReason::Quit));
    assert!((best - 0.625).abs() < 1e-6, "best fraction seen was {best}");
}
