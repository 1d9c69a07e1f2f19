//! Error display strings.

use gridvisor::AppError;

#[test]
fn display_prefixes_by_kind() {
    assert_eq!(AppError::Config("bad".into()).to_string(), "config: bad");
    assert_eq!(AppError::Lock("held".into()).to_string(), "lock: held");
    assert_eq!(AppError::Checkpoint("disk".into()).to_string(), "checkpoint: disk");
}

#[test]
fn child_failure_names_the_task() {
    let exited = AppError::ChildFailed {
        task: "solver".into(),
        code: Some(3),
    };
    assert_eq!(exited.to_string(), "child failed: solver exited with code 3");

    let signalled = AppError::ChildFailed {
        task: "solver".into(),
        code: None,
    };
    assert_eq!(signalled.to_string(), "child failed: solver terminated by signal");
}

#[test]
fn io_and_toml_errors_convert() {
    let io: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(io, AppError::Io(msg) if msg.contains("gone")));

    let toml_err = toml::from_str::<toml::Value>("= broken").unwrap_err();
    let converted: AppError = toml_err.into();
    assert!(matches!(converted, AppError::Config(_)));
}
