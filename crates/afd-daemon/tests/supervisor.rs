//! Runs a whole supervisor in a temporary work directory and talks to it
//! over its FIFOs.

use std::time::Duration;

use afd_config::path::AFD_ACTIVE_FILE;
use afd_config::testing::TestEnvironment;
use afd_config::Config;
use afd_ipc::{ActiveLock, CommandChannel, ACKN, IS_ALIVE, SHUTDOWN};

fn prepare() -> (TestEnvironment, Config) {
    let env = TestEnvironment::new().unwrap();
    let in1 = env.source_dir("in1");
    env.write_dir_config(&format!(
        "[directory] {} in1\n   [files]\n   *\n      [destination]\n         [recipient]\n         ftp://u:p@h1/out/\n",
        in1.display()
    ));
    let mut config = Config::default();
    config.afd.default_response_time = 2;
    (env, config)
}

async fn wait_alive(channel: &CommandChannel) {
    for _ in 0..100 {
        if let Ok(ACKN) = channel.request(IS_ALIVE, Duration::from_millis(200)).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("supervisor never answered IS_ALIVE");
}

#[tokio::test]
async fn test_start_answer_and_shutdown() {
    let (env, config) = prepare();
    let work_dir = env.work_dir.clone();
    let task = tokio::spawn(afd_daemon::run(work_dir.clone(), config.clone(), false));

    let channel = CommandChannel::afd(&work_dir);
    wait_alive(&channel).await;
    let pid = afd_daemon::active_pid(&work_dir).unwrap();
    assert_eq!(pid, Some(std::process::id()));

    // A second instance on the same work directory refuses to start
    let second = afd_daemon::run(work_dir.clone(), config, false).await;
    let err = second.unwrap_err().to_string();
    assert!(err.contains("already active"), "{}", err);

    let reply = channel.request(SHUTDOWN, Duration::from_secs(10)).await.unwrap();
    assert_eq!(reply, ACKN);
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(ActiveLock::probe(&work_dir.fifo(AFD_ACTIVE_FILE)).unwrap(), None);
    let system_log = std::fs::read_to_string(work_dir.log_dir().join("SYSTEM_LOG.0")).unwrap();
    assert!(system_log.contains("AFD starting"), "{}", system_log);
}
