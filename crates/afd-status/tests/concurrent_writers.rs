//! Two writers in one process, each with its own FSA handle, as the
//! generator and the dispatcher run inside `afdd`.

use afd_config::testing::TestEnvironment;
use afd_status::fsa::{Fsa, ERROR_QUEUE_SET, PAUSE_QUEUE};
use afd_status::{Fra, HostConfigEntry};

const ROUNDS: u32 = 500;

#[test]
fn test_counter_updates_survive_config_sync() {
    let env = TestEnvironment::new().unwrap();
    let wd = &env.work_dir;
    let hosts = vec![HostConfigEntry::new("h1"), HostConfigEntry::new("h2")];
    Fsa::attach(wd).unwrap().sync(&hosts, None).unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let mut dispatcher = Fsa::attach(wd).unwrap();
            for i in 0..ROUNDS {
                dispatcher
                    .update(0, |h| {
                        h.error_counter += 1;
                        h.bytes_send += 10;
                    })
                    .unwrap();
                let (set, clear) = if i % 2 == 0 { (ERROR_QUEUE_SET, 0) } else { (0, ERROR_QUEUE_SET) };
                dispatcher.change_status(0, set, clear).unwrap();
            }
        });
        scope.spawn(|| {
            let mut generator = Fsa::attach(wd).unwrap();
            let mut changed = hosts.clone();
            for i in 0..ROUNDS {
                changed[0].allowed_transfers = (i % 4 + 1) as i32;
                generator.sync(&changed, None).unwrap();
                generator.change_status(1, PAUSE_QUEUE, 0).unwrap();
            }
        });
    });

    let fsa = Fsa::attach(wd).unwrap();
    let h1 = fsa.host(0).unwrap();
    assert_eq!(h1.error_counter, ROUNDS as i32);
    assert_eq!(h1.bytes_send, ROUNDS as u64 * 10);
    assert_eq!(h1.host_status & ERROR_QUEUE_SET, 0);
    assert_eq!(h1.allowed_transfers, ((ROUNDS - 1) % 4 + 1) as i32);
    assert_eq!(fsa.host(1).unwrap().host_status, PAUSE_QUEUE);
}

#[test]
fn test_queue_counters_survive_directory_updates() {
    let env = TestEnvironment::new().unwrap();
    let wd = &env.work_dir;
    {
        let mut fra = Fra::attach(wd).unwrap();
        fra.sync(&[afd_status::DirectoryStatus::new(1, "in1", "/data/in1")]).unwrap();
    }

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let mut fra = Fra::attach(wd).unwrap();
            for _ in 0..ROUNDS {
                fra.adjust_queue_counters(0, 1, 100).unwrap();
            }
        });
        scope.spawn(|| {
            let mut fra = Fra::attach(wd).unwrap();
            for i in 0..ROUNDS {
                fra.update(0, |d| d.files_in_dir = i).unwrap();
            }
        });
    });

    let d = Fra::attach(wd).unwrap().dir(0).unwrap();
    assert_eq!((d.files_queued, d.bytes_in_queue), (ROUNDS, ROUNDS as u64 * 100));
    assert_eq!(d.files_in_dir, ROUNDS - 1);
}
