//! FSA generation swap as seen by a second, concurrently attached reader.

use afd_config::testing::TestEnvironment;
use afd_status::fsa::{Fsa, PAUSE_QUEUE};
use afd_status::{DirectoryStatus, Fra, HostConfigEntry};

fn hosts(aliases: &[&str]) -> Vec<HostConfigEntry> {
    aliases.iter().map(|a| HostConfigEntry::new(a)).collect()
}

#[test]
fn test_swap_is_atomic_for_readers() {
    let env = TestEnvironment::new().unwrap();
    let wd = &env.work_dir;

    let mut writer = Fsa::attach(wd).unwrap();
    writer.sync(&hosts(&["h1", "h2"]), None).unwrap();
    writer.update(0, |h| h.bytes_send = 100).unwrap();
    writer.change_status(1, PAUSE_QUEUE, 0).unwrap();

    let mut fra = Fra::attach(wd).unwrap();
    let mut d1 = DirectoryStatus::new(11, "from_h1", "ftp://h1/in");
    d1.set_host_alias("h1");
    d1.fsa_pos = 0;
    let mut d2 = DirectoryStatus::new(22, "from_h2", "ftp://h2/in");
    d2.set_host_alias("h2");
    d2.fsa_pos = 1;
    fra.sync(&[d1, d2]).unwrap();

    let mut reader = Fsa::attach(wd).unwrap();
    let old_id = reader.id();
    assert_eq!(reader.host(0).unwrap().alias(), "h1");

    writer.reorder(&hosts(&["h2", "h1"]), Some(&mut fra)).unwrap();

    // New generation in place, old one gone from disk
    assert_eq!(writer.id(), old_id + 1);
    assert!(!wd.fsa_file(old_id).exists());
    assert!(wd.fsa_file(old_id + 1).exists());
    assert_eq!(writer.host(0).unwrap().alias(), "h2");

    // Runtime state travelled with the host
    let h1 = writer.host(1).unwrap();
    assert_eq!(h1.bytes_send, 100);
    assert_eq!(writer.host(0).unwrap().host_status, PAUSE_QUEUE);

    // Cross references follow the new order
    assert_eq!(fra.dir(0).unwrap().fsa_pos, 1);
    assert_eq!(fra.dir(1).unwrap().fsa_pos, 0);

    // The old reader still sees its consistent snapshot
    assert_eq!(reader.host(0).unwrap().alias(), "h1");
    assert!(reader.is_stale().unwrap());
    assert!(reader.reattach_if_stale().unwrap());
    assert_eq!(reader.id(), old_id + 1);
    assert_eq!(reader.host(0).unwrap().alias(), "h2");
    assert!(!reader.reattach_if_stale().unwrap());
}

#[test]
fn test_removed_alias_shrinks_count() {
    let env = TestEnvironment::new().unwrap();
    let mut fsa = Fsa::attach(&env.work_dir).unwrap();
    fsa.sync(&hosts(&["a", "b", "c"]), None).unwrap();
    fsa.sync(&hosts(&["c", "a"]), None).unwrap();
    assert_eq!(fsa.len(), 2);
    assert_eq!(fsa.position("b"), None);
    assert_eq!(fsa.position("a"), Some(1));

    let written: Vec<String> = fsa.to_config().into_iter().map(|h| h.alias).collect();
    assert_eq!(written, vec!["c", "a"]);
}
