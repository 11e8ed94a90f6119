//! End-to-end tests of the generator against a scratch work directory.

use std::fs;
use std::path::Path;

use afd_amg::fsops::now;
use afd_amg::{Amg, NewMessage, PoolName};
use afd_config::testing::TestEnvironment;
use afd_config::Config;
use afd_log::{DeleteReason, DistributionType, Logs, MemoryLogs};
use afd_status::fsa::{HOST_DISABLED, PAUSE_QUEUE};
use tokio::sync::mpsc;

struct Setup {
    env: TestEnvironment,
    amg: Amg,
    rx: mpsc::UnboundedReceiver<NewMessage>,
    mem: MemoryLogs,
}

fn setup(dir_config: impl Fn(&Path) -> String) -> Setup {
    let env = TestEnvironment::new().unwrap();
    let in1 = env.source_dir("in1");
    env.write_dir_config(&dir_config(&in1));
    let (logs, mem) = Logs::memory();
    let (tx, rx) = mpsc::unbounded_channel();
    let amg = Amg::open(env.work_dir.clone(), Config::default(), logs, tx).unwrap();
    Setup { env, amg, rx, mem }
}

fn two_hosts(dir: &Path) -> String {
    format!(
        "[directory] {} in1\n   [files]\n   *.bin\n      [destination]\n         [recipient]\n         ftp://u:p@h1/out/\n         sftp://u@h2/out/\n",
        dir.display()
    )
}

fn one_host(dir: &Path, dir_options: &str, job_options: &str) -> String {
    format!(
        "[directory] {} in1\n   [dir options]\n{}\n   [files]\n   *.bin\n      [destination]\n         [recipient]\n         ftp://u:p@h1/out/\n         [options]\n{}\n",
        dir.display(),
        dir_options,
        job_options
    )
}

fn drain(rx: &mut mpsc::UnboundedReceiver<NewMessage>) -> Vec<NewMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn set_host(amg: &mut Amg, alias: &str, set: u32, clear: u32) {
    let pos = amg.fsa().position(alias).unwrap();
    amg.fsa_mut().change_status(pos, set, clear).unwrap();
}

fn queue_counters(amg: &Amg) -> (u32, u64) {
    let dir_id = amg.catalog().dirs[0].dir_id;
    let pos = amg.fra().position_by_id(dir_id).unwrap();
    let d = amg.fra().dir(pos).unwrap();
    (d.files_queued, d.bytes_in_queue)
}

#[test]
fn test_file_fans_out_to_every_job() {
    let mut s = setup(two_hosts);
    let in1 = s.env.source_dir("in1");
    fs::write(in1.join("a.bin"), b"hello").unwrap();
    fs::write(in1.join("notes.txt"), b"x").unwrap();

    let created = s.amg.scan_all(now(), true).unwrap();
    assert_eq!(created, 2);

    let msgs = drain(&mut s.rx);
    assert_eq!(msgs.len(), 2);
    let mut hosts: Vec<_> = msgs.iter().map(|m| m.host_alias.as_str()).collect();
    hosts.sort();
    assert_eq!(hosts, vec!["h1", "h2"]);
    for msg in &msgs {
        assert_eq!((msg.files, msg.bytes), (1, 5));
        let dir = s.env.work_dir.outgoing_dir().join(msg.msg_name());
        assert_eq!(fs::read(dir.join("a.bin")).unwrap(), b"hello");
    }

    // matched file consumed, unmatched one left alone, pool emptied
    assert!(!in1.join("a.bin").exists());
    assert!(in1.join("notes.txt").exists());
    assert_eq!(fs::read_dir(s.env.work_dir.pool_dir()).unwrap().count(), 0);

    let dist = s.mem.distribution_records();
    assert_eq!(dist.len(), 1);
    assert_eq!(dist[0].dist_type, DistributionType::Normal);
    assert_eq!(dist[0].job_ids.len(), 2);
}

#[test]
fn test_paused_host_queues_then_requeues() {
    let mut s = setup(|d| one_host(d, "", "priority 5"));
    let in1 = s.env.source_dir("in1");
    set_host(&mut s.amg, "h1", PAUSE_QUEUE, 0);

    fs::write(in1.join("a.bin"), b"1234").unwrap();
    s.amg.scan_all(now(), true).unwrap();
    assert!(drain(&mut s.rx).is_empty());
    assert!(in1.join(".h1/a.bin").exists());
    assert_eq!(queue_counters(&s.amg), (1, 4));
    assert_eq!(
        s.mem.distribution_records()[0].dist_type,
        DistributionType::QueueStopped
    );

    // un-pause: the paused file becomes a message and the counters drop
    set_host(&mut s.amg, "h1", 0, PAUSE_QUEUE);
    s.amg.check_hosts(now()).unwrap();
    let msgs = drain(&mut s.rx);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].files, 1);
    assert_eq!(queue_counters(&s.amg), (0, 0));
    assert!(!in1.join(".h1/a.bin").exists());
}

#[test]
fn test_disabled_host_deletes_paused_files() {
    let mut s = setup(|d| one_host(d, "", "priority 5"));
    let in1 = s.env.source_dir("in1");
    set_host(&mut s.amg, "h1", PAUSE_QUEUE, 0);
    fs::write(in1.join("a.bin"), b"1234").unwrap();
    fs::write(in1.join("b.bin"), b"12").unwrap();
    s.amg.scan_all(now(), true).unwrap();
    assert_eq!(queue_counters(&s.amg), (2, 6));

    set_host(&mut s.amg, "h1", HOST_DISABLED, 0);
    s.amg.check_hosts(now()).unwrap();
    assert!(!in1.join(".h1").exists());
    assert_eq!(queue_counters(&s.amg), (0, 0));
    let deleted = s.mem.delete_records();
    assert_eq!(deleted.len(), 2);
    assert!(deleted.iter().all(|r| r.reason == DeleteReason::HostDisabled));

    // new files for a disabled host are deleted on arrival
    fs::write(in1.join("c.bin"), b"1").unwrap();
    s.amg.scan_all(now(), true).unwrap();
    assert!(!in1.join("c.bin").exists());
    assert!(drain(&mut s.rx).is_empty());
    let last = s.mem.distribution_records().pop().unwrap();
    assert_eq!(last.dist_type, DistributionType::Disabled);
}

#[test]
fn test_input_duplicate_is_deleted() {
    let mut s = setup(|d| one_host(d, "   dupcheck 600 1 24", "priority 5"));
    let in1 = s.env.source_dir("in1");

    fs::write(in1.join("a.bin"), b"first").unwrap();
    s.amg.scan_all(now(), true).unwrap();
    assert_eq!(drain(&mut s.rx).len(), 1);

    fs::write(in1.join("a.bin"), b"second").unwrap();
    s.amg.scan_all(now(), true).unwrap();
    assert!(drain(&mut s.rx).is_empty());
    assert!(!in1.join("a.bin").exists());

    let deleted = s.mem.delete_records();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].reason, DeleteReason::DupInput);
    let last = s.mem.distribution_records().pop().unwrap();
    assert_eq!(last.dist_type, DistributionType::DupDel);
}

#[test]
fn test_time_job_waits_for_crontab() {
    let mut s = setup(|d| one_host(d, "", "         time * * * * *"));
    let in1 = s.env.source_dir("in1");
    fs::write(in1.join("a.bin"), b"abc").unwrap();

    let t = now();
    s.amg.scan_all(t, true).unwrap();
    assert!(drain(&mut s.rx).is_empty());
    let job_id = s.amg.catalog().dirs[0].jobs[0].job_id;
    let time_dir = s.env.work_dir.time_dir().join(format!("{:x}", job_id));
    assert!(time_dir.join("a.bin").exists());

    assert_eq!(s.amg.check_time_jobs(t + 120).unwrap(), 1);
    let msgs = drain(&mut s.rx);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].name.job_id, job_id);
    assert!(!time_dir.exists());
}

#[test]
fn test_delete_local_option_drops_message() {
    let mut s = setup(|d| one_host(d, "", "         delete"));
    let in1 = s.env.source_dir("in1");
    fs::write(in1.join("a.bin"), b"abc").unwrap();

    assert_eq!(s.amg.scan_all(now(), true).unwrap(), 0);
    assert!(drain(&mut s.rx).is_empty());
    let deleted = s.mem.delete_records();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].reason, DeleteReason::UserDel);
}

#[test]
fn test_recover_moves_pool_files_back() {
    let mut s = setup(|d| one_host(d, "", "priority 5"));
    let in1 = s.env.source_dir("in1");
    let dir_id = s.amg.catalog().dirs[0].dir_id;
    let name = PoolName {
        pid: 4242,
        creation_time: now(),
        unique_number: 1,
        dir_id,
        disambig: None,
    };
    let pool = s.env.work_dir.pool_dir().join(name.to_string());
    fs::create_dir_all(&pool).unwrap();
    fs::write(pool.join("left.bin"), b"x").unwrap();
    let junk = s.env.work_dir.pool_dir().join("not-a-pool-name");
    fs::create_dir_all(&junk).unwrap();
    fs::write(junk.join("j"), b"x").unwrap();

    s.amg.recover().unwrap();
    assert!(in1.join("left.bin").exists());
    assert!(!pool.exists());
    assert!(!junk.exists());
    let deleted = s.mem.delete_records();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].reason, DeleteReason::PoolRecovery);
}

#[test]
fn test_backpressure_holds_directory() {
    let mut s = setup(|d| one_host(d, "   max files 1\n   max queued files 1", "priority 5"));
    let in1 = s.env.source_dir("in1");
    set_host(&mut s.amg, "h1", PAUSE_QUEUE, 0);
    fs::write(in1.join("a.bin"), b"1").unwrap();
    s.amg.scan_all(now(), true).unwrap();
    assert_eq!(queue_counters(&s.amg), (1, 1));

    // at the limit is not over it
    fs::write(in1.join("b.bin"), b"2").unwrap();
    s.amg.scan_all(now(), true).unwrap();
    assert!(!in1.join("b.bin").exists());
    assert_eq!(queue_counters(&s.amg), (2, 2));

    // over the limit: the directory is not touched
    fs::write(in1.join("c.bin"), b"3").unwrap();
    s.amg.scan_all(now(), true).unwrap();
    assert!(in1.join("c.bin").exists());
    assert_eq!(queue_counters(&s.amg), (2, 2));
}

#[test]
fn test_undistributed_files_go_back_to_their_directory() {
    let mut s = setup(|d| one_host(d, "", "priority 5"));
    let in1 = s.env.source_dir("in1");
    set_host(&mut s.amg, "h1", PAUSE_QUEUE, 0);
    // a plain file where the paused directory belongs
    fs::write(in1.join(".h1"), b"").unwrap();
    fs::write(in1.join("a.bin"), b"1234").unwrap();

    assert_eq!(s.amg.scan_all(now(), true).unwrap(), 0);
    assert_eq!(fs::read(in1.join("a.bin")).unwrap(), b"1234");
    assert_eq!(fs::read_dir(s.env.work_dir.pool_dir()).unwrap().count(), 0);
    assert!(s.mem.delete_records().is_empty());
    assert!(s.mem.distribution_records().is_empty());
    assert_eq!(queue_counters(&s.amg), (0, 0));
}

#[test]
fn test_job_failing_after_commit_logs_the_loss() {
    let mut s = setup(two_hosts);
    let in1 = s.env.source_dir("in1");
    set_host(&mut s.amg, "h2", PAUSE_QUEUE, 0);
    fs::write(in1.join(".h2"), b"").unwrap();
    fs::write(in1.join("a.bin"), b"hello").unwrap();

    assert_eq!(s.amg.scan_all(now(), true).unwrap(), 1);
    let msgs = drain(&mut s.rx);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].host_alias, "h1");

    // committed to h1, so it is not handed out a second time
    assert!(!in1.join("a.bin").exists());
    assert_eq!(fs::read_dir(s.env.work_dir.pool_dir()).unwrap().count(), 0);
    assert_eq!(s.amg.scan_all(now(), true).unwrap(), 0);

    let deleted = s.mem.delete_records();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].reason, DeleteReason::DistributionFailure);
    assert_eq!(deleted[0].host_alias, "h2");
    assert_eq!(deleted[0].file_name, "a.bin");
    let dist = s.mem.distribution_records();
    assert_eq!(dist.len(), 1);
    assert_eq!(dist[0].job_ids.len(), 1);
}

#[test]
fn test_reread_keeps_masks_of_earlier_jobs() {
    let mut s = setup(two_hosts);
    let old_mask = s.amg.catalog().dirs[0].jobs[0].file_mask_id;
    let in1 = s.env.source_dir("in1");
    s.env.write_dir_config(&two_hosts(&in1).replace("*.bin", "*.txt"));
    s.amg.reread_config().unwrap();

    let new_mask = s.amg.catalog().dirs[0].jobs[0].file_mask_id;
    assert_ne!(old_mask, new_mask);
    let masks = afd_catalog::FileMaskDb::new(s.env.work_dir.fifo(afd_config::path::FILE_MASK_FILE));
    assert_eq!(masks.lookup(old_mask).unwrap(), Some(vec!["*.bin".to_string()]));
    assert_eq!(masks.entries().unwrap().len(), 2);
    assert!(s.mem.maintainer.lines().iter().all(|l| !l.contains("do not match")));
}
