//! Single-slot mailbox semantics.

use gridvisor::channel::{AppChannels, ChannelKind, ClientChannels, Segment, SEGMENT_SIZE};

#[test]
fn send_into_occupied_slot_fails_and_keeps_first_message() {
    let segment = Segment::anonymous().unwrap();
    let app = AppChannels::new(&segment);
    let client = ClientChannels::new(&segment);

    assert!(client.process_control.send("<suspend/>"));
    assert!(client.process_control.has_pending());
    assert!(!client.process_control.send("<quit/>"), "second send must be refused");

    assert_eq!(app.process_control.receive().as_deref(), Some("<suspend/>"));
    assert_eq!(app.process_control.receive(), None);
    assert!(!client.process_control.has_pending());
}

#[test]
fn receive_on_empty_slot_is_not_an_error() {
    let segment = Segment::anonymous().unwrap();
    let app = AppChannels::new(&segment);
    assert_eq!(app.heartbeat.receive(), None);
    assert!(!app.heartbeat.has_pending());
}

#[test]
fn slot_frees_after_receive() {
    let segment = Segment::anonymous().unwrap();
    let app = AppChannels::new(&segment);
    let client = ClientChannels::new(&segment);

    assert!(app.app_status.send("<fraction_done>0.1</fraction_done>"));
    assert!(app.app_status.has_pending());
    assert!(client.app_status.receive().is_some());
    assert!(!app.app_status.has_pending());
    assert!(app.app_status.send("<fraction_done>0.2</fraction_done>"));
}

#[test]
fn directions_are_fixed_by_construction() {
    let segment = Segment::anonymous().unwrap();
    let app = AppChannels::new(&segment);
    let client = ClientChannels::new(&segment);

    assert_eq!(app.process_control.kind(), ChannelKind::ProcessControl);
    assert_eq!(client.process_control.kind(), ChannelKind::ProcessControl);
    assert_eq!(app.app_status.kind(), ChannelKind::AppStatus);
    assert_eq!(client.trickle_up.kind(), ChannelKind::TrickleUp);
}

#[test]
fn file_backed_segment_is_shared_between_mappings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mmap");

    let client_side = Segment::create(&path).unwrap();
    let app_side = Segment::attach(&path).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), SEGMENT_SIZE as u64);
    assert_eq!(app_side.path(), Some(path.as_path()));

    let client = ClientChannels::new(&client_side);
    let app = AppChannels::new(&app_side);
    assert!(client.heartbeat.send("<heartbeat/>"));
    assert_eq!(app.heartbeat.receive().as_deref(), Some("<heartbeat/>"));
    assert!(!client.heartbeat.has_pending());
}

#[test]
fn attach_rejects_missing_or_short_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Segment::attach(dir.path().join("absent")).is_err());

    let short = dir.path().join("short");
    std::fs::write(&short, [0_u8; 16]).unwrap();
    assert!(Segment::attach(&short).is_err());
}

#[test]
fn create_resets_stale_messages() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mmap");
    {
        let segment = Segment::create(&path).unwrap();
        assert!(ClientChannels::new(&segment).process_control.send("<quit/>"));
    }
    let segment = Segment::create(&path).unwrap();
    assert_eq!(AppChannels::new(&segment).process_control.receive(), None);
}
