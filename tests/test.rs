// End-to-end tests for the coherent-cache core: single-cache behavior,
// cross-cache MESI traffic, the PE register machine, and the dot-product
// workload under both run modes.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use cachesim_mp::commons::{line_base_for, tag, SETS, WAYS};
use cachesim_mp::workload;
use cachesim_mp::{Cache, Interconnect, MainMemory, MesiState, ProcessingElement, SimError};
use cachesim_mp::Instruction;

fn mp_system(n: usize) -> (Arc<MainMemory>, Arc<Interconnect>, Vec<Arc<Cache>>) {
    let mem = Arc::new(MainMemory::new());
    let bus = Arc::new(Interconnect::new());
    let caches = (0..n)
        .map(|i| {
            let c = Arc::new(Cache::new(i as u32, mem.clone()));
            c.attach_to_bus(&bus);
            bus.attach(&c);
            c
        })
        .collect();
    (mem, bus, caches)
}

/// Coherence invariants for one line across all caches: at most one owner
/// in M or E, and an M owner excludes every other valid copy.
fn assert_coherent(caches: &[Arc<Cache>], addr: u64) {
    let states: Vec<MesiState> = caches.iter().filter_map(|c| c.line_mesi(addr)).collect();
    let owners = states
        .iter()
        .filter(|s| matches!(s, MesiState::Modified | MesiState::Exclusive))
        .count();
    assert!(owners <= 1, "more than one owner for {:#x}: {:?}", addr, states);
    if states.contains(&MesiState::Modified) {
        assert_eq!(
            states.len(),
            1,
            "Modified copy of {:#x} coexists with {:?}",
            addr,
            states
        );
    }
}

/// Per-line structural invariants: dirty implies Modified, Invalid implies
/// empty.
fn assert_line_invariants(cache: &Cache) {
    for set in 0..SETS {
        for way in 0..WAYS {
            let info = cache.line_info(set, way).unwrap();
            if info.dirty {
                assert_eq!(info.mesi, MesiState::Modified);
            }
            if info.mesi == MesiState::Invalid {
                assert!(!info.valid && !info.dirty);
            }
            if info.valid {
                assert_ne!(info.mesi, MesiState::Invalid);
            }
        }
    }
}

// single-cache behavior

#[test]
fn cold_miss_then_hit() {
    let mem = Arc::new(MainMemory::new());
    mem.write_double(0x0000, 3.14159).unwrap();
    let cache = Cache::new(0, mem.clone());

    let (v, hit) = cache.load_double(0x0000).unwrap();
    assert_eq!(v, 3.14159);
    assert!(!hit);
    let s = cache.stats();
    assert_eq!(s.mem_reads, 4);
    assert_eq!(s.misses, 1);
    assert_eq!(s.line_fills, 1);

    let (v, hit) = cache.load_double(0x0000).unwrap();
    assert_eq!(v, 3.14159);
    assert!(hit);
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn write_allocate_with_eviction() {
    // 0x0000, 0x0100, 0x0200 all map to set 0; three stores into a 2-way
    // set force exactly one eviction
    let mem = Arc::new(MainMemory::new());
    let cache = Cache::new(0, mem.clone());

    cache.store_double(0x0000, 10.0).unwrap();
    cache.store_double(0x0100, 20.0).unwrap();
    cache.store_double(0x0200, 30.0).unwrap();
    cache.flush_all().unwrap();

    assert_eq!(mem.read_double(0x0000).unwrap(), 10.0);
    assert_eq!(mem.read_double(0x0100).unwrap(), 20.0);
    assert_eq!(mem.read_double(0x0200).unwrap(), 30.0);

    let s = cache.stats();
    assert_eq!(s.hits, 0);
    assert_eq!(s.misses, 3);
    assert_eq!(s.line_fills, 3);
    assert_eq!(s.writebacks, 3);
    assert_eq!(s.mem_reads, 12);
    assert_eq!(s.mem_writes, 12);
}

#[test]
fn store_load_roundtrip() {
    let mem = Arc::new(MainMemory::new());
    let cache = Cache::new(0, mem);
    assert!(!cache.store_word(0x40, 0xdead_beef_cafe_f00d).unwrap());
    let (v, hit) = cache.load_word(0x40).unwrap();
    assert_eq!(v, 0xdead_beef_cafe_f00d);
    assert!(hit);
}

#[test]
fn doubles_are_bit_exact_through_the_cache() {
    let mem = Arc::new(MainMemory::new());
    let cache = Cache::new(0, mem);

    let nan = f64::from_bits(0x7ff8_dead_beef_1234);
    cache.store_double(0x0000, nan).unwrap();
    let (v, _) = cache.load_double(0x0000).unwrap();
    assert_eq!(v.to_bits(), nan.to_bits());

    cache.store_double(0x0008, -0.0).unwrap();
    let (v, _) = cache.load_double(0x0008).unwrap();
    assert_eq!(v.to_bits(), (-0.0f64).to_bits());
}

#[test]
fn flush_all_is_idempotent() {
    let mem = Arc::new(MainMemory::new());
    let cache = Cache::new(0, mem.clone());
    cache.store_double(0x40, 1.5).unwrap();

    cache.flush_all().unwrap();
    let first = cache.stats();
    assert_eq!(first.writebacks, 1);
    assert_eq!(first.mem_writes, 4);
    // a flushed line is clean; flushing again writes nothing
    cache.flush_all().unwrap();
    assert_eq!(cache.stats(), first);
    // the line is still resident and Modified
    assert_eq!(cache.line_mesi(0x40), Some(MesiState::Modified));
}

#[test]
fn invalidate_all_discards_and_misses() {
    let mem = Arc::new(MainMemory::new());
    let cache = Cache::new(0, mem.clone());
    cache.store_double(0x40, 2.5).unwrap();
    let stats_before = cache.stats();

    cache.invalidate_all();
    assert_eq!(cache.stats(), stats_before);
    assert_eq!(cache.line_mesi(0x40), None);
    assert_line_invariants(&cache);

    // dirty data was discarded, so the load refetches the memory copy
    let (v, hit) = cache.load_double(0x40).unwrap();
    assert!(!hit);
    assert_eq!(v, 0.0);
}

#[test]
fn unaligned_access_fails_without_effect() {
    let mem = Arc::new(MainMemory::new());
    let cache = Cache::new(0, mem);

    assert_eq!(
        cache.load_word(0x0004),
        Err(SimError::Misaligned { addr: 0x0004 })
    );
    assert_eq!(
        cache.store_word(0x0013, 7),
        Err(SimError::Misaligned { addr: 0x0013 })
    );
    assert_eq!(cache.stats(), Default::default());
    for set in 0..SETS {
        for way in 0..WAYS {
            assert!(!cache.line_info(set, way).unwrap().valid);
        }
    }
}

#[test]
fn out_of_range_fill_surfaces_the_memory_error() {
    let mem = Arc::new(MainMemory::new());
    let cache = Cache::new(0, mem);
    // 512 words of memory end at 0x1000
    let addr = 0x2000u64;
    assert_eq!(
        cache.load_word(addr),
        Err(SimError::OutOfRange { addr })
    );
    // the failed fill installed nothing
    assert_eq!(cache.line_mesi(addr), None);
}

#[test]
fn inspection_indices_are_checked() {
    let mem = Arc::new(MainMemory::new());
    let cache = Cache::new(0, mem);
    assert_eq!(cache.line_info(SETS, 0).unwrap_err(), SimError::BadSet(SETS));
    assert_eq!(cache.line_info(0, WAYS).unwrap_err(), SimError::BadWay(WAYS));
}

#[test]
fn lru_prefers_invalid_ways() {
    // three tags on set 3: ways fill in index order, then the oldest way
    // is evicted
    let mem = Arc::new(MainMemory::new());
    let cache = Cache::new(0, mem.clone());
    let a = line_base_for(0, 3);
    let b = line_base_for(1, 3);
    let c = line_base_for(2, 3);

    cache.store_double(a, 10.0).unwrap();
    assert_eq!(cache.line_info(3, 0).unwrap().tag, tag(a));
    cache.store_double(b, 20.0).unwrap();
    assert_eq!(cache.line_info(3, 1).unwrap().tag, tag(b));

    cache.store_double(c, 30.0).unwrap();
    // way 0 held the smallest use-tick
    assert_eq!(cache.line_info(3, 0).unwrap().tag, tag(c));
    assert_eq!(cache.line_info(3, 1).unwrap().tag, tag(b));
    // the evicted dirty line went back to memory without a flush
    assert_eq!(mem.read_double(a).unwrap(), 10.0);
}

#[test]
fn trace_hook_sees_transitions_and_emissions() {
    let (_mem, _bus, caches) = mp_system(2);
    let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    caches[0].set_trace_hook(move |l| sink.lock().push(l.to_string()));

    caches[0].store_double(0x0000, 1.0).unwrap();
    let seen = lines.lock();
    assert!(seen.iter().any(|l| l.contains("BusRdX")));
    assert!(seen.iter().any(|l| l.contains("-> M")));
}

// cross-cache MESI traffic

#[test]
fn writer_chain_four_caches() {
    let (mem, _bus, caches) = mp_system(4);
    mem.write_double(0x0000, 0.0).unwrap();

    for (i, c) in caches.iter().enumerate() {
        let hit = c.store_double(0x0000, (i + 1) as f64 * 11.0).unwrap();
        assert!(!hit, "every store after an invalidation is a miss");
        assert_coherent(&caches, 0x0000);
    }
    // each store invalidated the previous owner after a snoop flush
    for c in &caches[..3] {
        assert_eq!(c.stats().snoop_to_i, 1);
    }
    assert_eq!(caches[1].stats().snoop_flush, 1);

    for c in &caches {
        let (v, _) = c.load_double(0x0000).unwrap();
        assert_eq!(v, 44.0);
        assert_coherent(&caches, 0x0000);
    }
    // the last writer was flushed by the first reader's BusRd and holds
    // the line Shared, like everyone else
    for c in &caches {
        assert_eq!(c.line_mesi(0x0000), Some(MesiState::Shared));
        assert_line_invariants(c);
    }

    for c in &caches {
        c.flush_all().unwrap();
    }
    assert_eq!(mem.read_double(0x0000).unwrap(), 44.0);
}

#[test]
fn reader_after_modifier() {
    let (mem, _bus, caches) = mp_system(2);

    caches[0].store_double(0x0040, 7.0).unwrap();
    assert_eq!(caches[0].line_mesi(0x0040), Some(MesiState::Modified));

    let (v, hit) = caches[1].load_double(0x0040).unwrap();
    assert_eq!(v, 7.0);
    assert!(!hit);
    // the owner flushed and demoted on the BusRd snoop
    assert_eq!(caches[0].line_mesi(0x0040), Some(MesiState::Shared));
    assert_eq!(caches[1].line_mesi(0x0040), Some(MesiState::Shared));
    assert_eq!(caches[0].stats().snoop_flush, 1);
    assert_eq!(mem.read_double(0x0040).unwrap(), 7.0);
    assert_coherent(&caches, 0x0040);
}

#[test]
fn shared_upgrade_invalidates_peer() {
    let (_mem, _bus, caches) = mp_system(2);

    caches[0].load_word(0x0080).unwrap();
    caches[1].load_word(0x0080).unwrap();
    assert_eq!(caches[0].line_mesi(0x0080), Some(MesiState::Shared));
    assert_eq!(caches[1].line_mesi(0x0080), Some(MesiState::Shared));

    let hit = caches[0].store_double(0x0080, 9.0).unwrap();
    assert!(hit, "a Shared store upgrades in place");
    assert_eq!(caches[0].line_mesi(0x0080), Some(MesiState::Modified));
    assert_eq!(caches[1].line_mesi(0x0080), None);
    assert_eq!(caches[1].stats().snoop_to_i, 1);
    assert_coherent(&caches, 0x0080);

    // the peer's next load misses, pulls 9.0, and demotes the writer
    let (v, hit) = caches[1].load_double(0x0080).unwrap();
    assert_eq!(v, 9.0);
    assert!(!hit);
    assert_eq!(caches[0].line_mesi(0x0080), Some(MesiState::Shared));
    assert_eq!(caches[1].line_mesi(0x0080), Some(MesiState::Shared));
    assert_coherent(&caches, 0x0080);
}

// concurrency

#[test]
fn concurrent_disjoint_stores() {
    let (mem, _bus, caches) = mp_system(4);

    thread::scope(|s| {
        for (i, cache) in caches.iter().enumerate() {
            s.spawn(move || {
                for k in 0..8u64 {
                    let addr = ((i as u64 * 8) + k) * 32;
                    cache.store_double(addr, (i * 100 + k as usize) as f64).unwrap();
                }
            });
        }
    });

    for c in &caches {
        c.flush_all().unwrap();
        assert_line_invariants(c);
    }
    for i in 0..4u64 {
        for k in 0..8u64 {
            let addr = (i * 8 + k) * 32;
            assert_eq!(mem.read_double(addr).unwrap(), (i * 100 + k) as f64);
        }
    }
}

#[test]
fn concurrent_same_line_stores_stay_coherent() {
    let (mem, _bus, caches) = mp_system(4);
    mem.write_double(0x0000, 0.0).unwrap();

    thread::scope(|s| {
        for (i, cache) in caches.iter().enumerate() {
            s.spawn(move || {
                for _ in 0..100 {
                    cache.store_double(0x0000, (i + 1) as f64).unwrap();
                }
            });
        }
    });

    assert_coherent(&caches, 0x0000);
    for c in &caches {
        assert_line_invariants(c);
        c.flush_all().unwrap();
    }
    let v = mem.read_double(0x0000).unwrap();
    assert!(
        [1.0, 2.0, 3.0, 4.0].contains(&v),
        "memory holds a value nobody wrote: {}",
        v
    );
}

// processing elements and the workload

#[test]
fn pe_load_store_through_cache() {
    let mem = Arc::new(MainMemory::new());
    mem.write_double(0x0000, 3.14159).unwrap();
    let cache = Arc::new(Cache::new(0, mem.clone()));

    let mut pe = ProcessingElement::new(0, cache.clone());
    pe.set_reg(0, 0x0000).unwrap();
    pe.load_program(vec![
        Instruction::Load { dst: 1, addr: 0 },
        Instruction::Store { src: 1, addr: 0 },
    ]);
    pe.run().unwrap();
    cache.flush_all().unwrap();

    assert_eq!(pe.reg_double(1).unwrap(), 3.14159);
    assert_eq!(mem.read_double(0x0000).unwrap(), 3.14159);
    assert_eq!(pe.read_ops(), 1);
    assert_eq!(pe.write_ops(), 1);
    let s = cache.stats();
    assert_eq!(s.misses, 1);
    assert_eq!(s.hits, 1);
}

#[test]
fn dot_product_parallel_threads() {
    let n = 16;
    let (mem, _bus, caches) = mp_system(4);
    let a: Vec<f64> = (1..=n).map(|i| i as f64).collect();
    let b = vec![2.0; n];
    let layout = workload::layout(n, 4).unwrap();
    workload::load_vectors(&mem, &layout, &a, &b, 4).unwrap();

    let pes: Vec<ProcessingElement> = caches
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mut pe = ProcessingElement::new(i as u32, c.clone());
            workload::configure_pe(&mut pe, &layout, i, n / 4).unwrap();
            pe
        })
        .collect();

    let handles: Vec<_> = pes
        .into_iter()
        .map(|mut pe| thread::spawn(move || pe.run().unwrap()))
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for c in &caches {
        c.flush_all().unwrap();
        assert_line_invariants(c);
    }
    let result = workload::collect_result(&mem, &layout, 4).unwrap();
    assert_eq!(result, workload::serial_dot(&a, &b));
    assert_eq!(result, 272.0);
}

#[test]
fn dot_product_single_step() {
    let n = 16;
    let (mem, _bus, caches) = mp_system(4);
    let a: Vec<f64> = (1..=n).map(|i| i as f64).collect();
    let b = vec![2.0; n];
    let layout = workload::layout(n, 4).unwrap();
    workload::load_vectors(&mem, &layout, &a, &b, 4).unwrap();

    let mut pes: Vec<ProcessingElement> = caches
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mut pe = ProcessingElement::new(i as u32, c.clone());
            workload::configure_pe(&mut pe, &layout, i, n / 4).unwrap();
            pe
        })
        .collect();

    // round-robin, one instruction per PE per pass
    loop {
        let mut progressed = false;
        for pe in pes.iter_mut() {
            if pe.step().unwrap() {
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    for c in &caches {
        c.flush_all().unwrap();
    }
    let result = workload::collect_result(&mem, &layout, 4).unwrap();
    assert_eq!(result, 272.0);
}
