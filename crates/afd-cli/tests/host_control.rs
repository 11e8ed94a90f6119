use afd_cli::host::{apply, HostAction};
use afd_config::path::FD_CMD_FIFO;
use afd_config::testing::TestEnvironment;
use afd_ipc::{CommandListener, FdCommand};
use afd_status::fsa::{ERROR_QUEUE_SET, HOST_DISABLED, PAUSE_QUEUE};
use afd_status::{host_config, Fsa, HostConfigEntry};

fn with_hosts(aliases: &[&str]) -> TestEnvironment {
    let env = TestEnvironment::new().unwrap();
    let hosts: Vec<HostConfigEntry> = aliases.iter().map(|a| HostConfigEntry::new(a)).collect();
    let mut fsa = Fsa::attach(&env.work_dir).unwrap();
    fsa.reorder(&hosts, None).unwrap();
    env
}

#[tokio::test]
async fn test_pause_without_afd_persists_to_host_config() {
    let env = with_hosts(&["h1", "h2"]);

    let change = apply(&env.work_dir, HostAction::Pause, "h2").await.unwrap().unwrap();
    assert_eq!(change.pos, 1);
    assert!(!change.notified);
    assert_ne!(change.host_status & PAUSE_QUEUE, 0);

    let fsa = Fsa::attach(&env.work_dir).unwrap();
    assert_ne!(fsa.host(1).unwrap().host_status & PAUSE_QUEUE, 0);
    assert_eq!(fsa.host(0).unwrap().host_status & PAUSE_QUEUE, 0);

    let saved = host_config::load(&env.work_dir.host_config()).unwrap();
    let h2 = saved.iter().find(|h| h.alias == "h2").unwrap();
    assert_ne!(h2.host_status & PAUSE_QUEUE, 0);

    let change = apply(&env.work_dir, HostAction::Resume, "h2").await.unwrap().unwrap();
    assert_eq!(change.host_status & PAUSE_QUEUE, 0);
}

#[tokio::test]
async fn test_running_dispatcher_is_notified() {
    let env = with_hosts(&["h1"]);
    let mut listener = CommandListener::open(&env.work_dir.fifo(FD_CMD_FIFO), None).unwrap();

    let change = apply(&env.work_dir, HostAction::Disable, "h1").await.unwrap().unwrap();
    assert!(change.notified);
    assert_ne!(change.host_status & HOST_DISABLED, 0);

    let bytes = listener.recv().await.unwrap();
    let (cmds, used) = FdCommand::decode_all(&bytes).unwrap();
    assert_eq!(used, bytes.len());
    assert_eq!(cmds, vec![FdCommand::DisableHost(0)]);
}

#[tokio::test]
async fn test_retry_leaves_error_queue() {
    let env = with_hosts(&["h1"]);
    let mut fsa = Fsa::attach(&env.work_dir).unwrap();
    fsa.change_status(0, ERROR_QUEUE_SET, 0).unwrap();

    let change = apply(&env.work_dir, HostAction::Retry, "h1").await.unwrap().unwrap();
    assert_eq!(change.host_status & ERROR_QUEUE_SET, 0);
}
