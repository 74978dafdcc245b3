use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use smmu::{
    AccessType, CommandEntry, PagePermissions, SmmuController, SmmuError, StreamConfig,
};
use smmu_config::SmmuConfiguration;

const THREADS: usize = 8;
const PER_THREAD: usize = 2_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn shared_controller() -> Arc<SmmuController> {
    let smmu = SmmuController::new(SmmuConfiguration::high_performance()).unwrap();
    for stream in 0..4u32 {
        smmu.configure_stream(stream, StreamConfig::stage1_only())
            .unwrap();
        for pasid in 1..=2 {
            smmu.create_stream_pasid(stream, pasid).unwrap();
            for page in 0..16u64 {
                let pa = (u64::from(stream) << 24) | (u64::from(pasid) << 20) | (page << 12);
                smmu.map_page(stream, pasid, page << 12, pa, PagePermissions::READ_WRITE)
                    .unwrap();
            }
        }
    }
    Arc::new(smmu)
}

#[test]
fn concurrent_translations_are_all_counted() {
    init_tracing();
    let smmu = shared_controller();
    let successes = Arc::new(AtomicU64::new(0));
    let failures = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let smmu = Arc::clone(&smmu);
            let successes = Arc::clone(&successes);
            let failures = Arc::clone(&failures);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let stream = ((t + i) % 5) as u32;
                    let pasid = (i % 2 + 1) as u32;
                    // Pages 16.. are unmapped and stream 4 is not configured.
                    let page = (i % 20) as u64;
                    let access = if i % 7 == 0 {
                        AccessType::Execute
                    } else {
                        AccessType::Read
                    };
                    match smmu.translate(stream, pasid, (page << 12) | 0x10, access) {
                        Ok(result) => {
                            let expected = (u64::from(stream) << 24)
                                | (u64::from(pasid) << 20)
                                | (page << 12)
                                | 0x10;
                            assert_eq!(result.physical_address, expected);
                            successes.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("translate thread");
    }

    let total = (THREADS * PER_THREAD) as u64;
    let stats = smmu.statistics();
    assert_eq!(smmu.total_translations(), total);
    assert_eq!(stats.successful_translations + stats.failed_translations, total);
    assert_eq!(stats.successful_translations, successes.load(Ordering::Relaxed));
    assert_eq!(stats.failed_translations, failures.load(Ordering::Relaxed));
    assert_eq!(stats.faults_recorded, stats.failed_translations);
    assert_eq!(stats.cache.hit_count + stats.cache.miss_count, stats.cache.total_lookups);
}

#[test]
fn configuration_changes_race_with_translate() {
    init_tracing();
    let smmu = shared_controller();
    let stop = Arc::new(AtomicBool::new(false));

    let translators: Vec<_> = (0..4)
        .map(|t| {
            let smmu = Arc::clone(&smmu);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut n = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let page = n % 16;
                    match smmu.translate(t, 1, page << 12, AccessType::Read) {
                        // Either the old or the new mapping, never anything else.
                        Ok(result) => {
                            let old = (u64::from(t) << 24) | (1 << 20) | (page << 12);
                            let new = 0x7000_0000 | (page << 12);
                            assert!(
                                result.physical_address == old
                                    || result.physical_address == new
                                    || result.bypassed,
                                "unexpected {:#x}",
                                result.physical_address
                            );
                        }
                        Err(SmmuError::StreamDisabled { .. })
                        | Err(SmmuError::InvalidConfiguration(_)) => {}
                        Err(err) => panic!("unexpected error {err}"),
                    }
                    n += 1;
                }
                n
            })
        })
        .collect();

    for round in 0..200u64 {
        let stream = (round % 4) as u32;
        match round % 5 {
            0 => smmu.disable_stream(stream).unwrap(),
            1 => smmu.enable_stream(stream).unwrap(),
            2 => smmu
                .configure_stream(stream, StreamConfig::bypass())
                .unwrap(),
            3 => smmu
                .configure_stream(stream, StreamConfig::stage1_only())
                .unwrap(),
            _ => {
                let page = round % 16;
                smmu.map_page(stream, 1, page << 12, 0x7000_0000 | (page << 12), PagePermissions::READ)
                    .unwrap();
                let mut config = SmmuConfiguration::high_performance();
                config.cache.tlb_cache_size = 64 + (round as usize % 3) * 64;
                smmu.update_configuration(config).unwrap();
            }
        }
    }
    stop.store(true, Ordering::Relaxed);

    let mut attempted = 0;
    for handle in translators {
        attempted += handle.join().expect("translate thread");
    }
    assert_eq!(smmu.total_translations(), attempted);
}

#[test]
fn no_stale_hit_after_invalidation_completes() {
    let smmu = shared_controller();
    let barrier = Arc::new(Barrier::new(3));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let smmu = Arc::clone(&smmu);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..5_000 {
                    let _ = smmu.translate(0, 1, 0x3000, AccessType::Read);
                }
            })
        })
        .collect();

    barrier.wait();
    for i in 0..100u64 {
        let pa = 0x9000_0000 + (i << 12);
        smmu.map_page(0, 1, 0x3000, pa, PagePermissions::READ).unwrap();
        // Once the remap (and its invalidation) returned, no reader may see the old frame.
        let result = smmu.translate(0, 1, 0x3000, AccessType::Read).unwrap();
        assert_eq!(result.physical_address, pa);
    }
    for reader in readers {
        reader.join().expect("reader thread");
    }
}

#[test]
fn concurrent_submitters_respect_capacity() {
    let mut config = SmmuConfiguration::default();
    config.queue.command_queue_size = 64;
    let smmu = Arc::new(SmmuController::new(config).unwrap());
    let accepted = Arc::new(AtomicU64::new(0));
    let rejected = Arc::new(AtomicU64::new(0));

    let submitters: Vec<_> = (0..THREADS)
        .map(|_| {
            let smmu = Arc::clone(&smmu);
            let accepted = Arc::clone(&accepted);
            let rejected = Arc::clone(&rejected);
            thread::spawn(move || {
                for _ in 0..100 {
                    match smmu.submit_command(CommandEntry::tlbi_nh_all()) {
                        Ok(()) => accepted.fetch_add(1, Ordering::Relaxed),
                        Err(SmmuError::CommandQueueFull { capacity }) => {
                            assert_eq!(capacity, 64);
                            rejected.fetch_add(1, Ordering::Relaxed)
                        }
                        Err(err) => panic!("unexpected error {err}"),
                    };
                    assert!(smmu.command_queue().len() <= 64);
                }
            })
        })
        .collect();
    let processor = {
        let smmu = Arc::clone(&smmu);
        thread::spawn(move || {
            let mut processed = 0;
            for _ in 0..200 {
                processed += smmu.process_command_queue().executed;
            }
            processed
        })
    };

    for submitter in submitters {
        submitter.join().expect("submit thread");
    }
    let mut processed = processor.join().expect("process thread");
    processed += smmu.process_command_queue().executed;

    let accepted = accepted.load(Ordering::Relaxed);
    assert_eq!(accepted + rejected.load(Ordering::Relaxed), (THREADS * 100) as u64);
    assert_eq!(processed as u64, accepted);
    let counters = smmu.command_queue().counters();
    assert_eq!(counters.accepted, accepted);
}
