// Demo binary: a parallel dot product over four processing elements, each
// with a private MESI-coherent cache on a shared bus. Runs either with one
// OS thread per PE or round-robin in single-step mode.

use std::sync::Arc;
use std::thread;

use clap::Parser;
use env_logger::Env;
use log::info;

use cachesim_mp::workload;
use cachesim_mp::{Cache, Interconnect, MainMemory, ProcessingElement, SimError};

const NUM_PES: usize = 4;

#[derive(Parser)]
#[command(
    name = "cachesim-mp",
    about = "Parallel dot product on a 4-core MESI-coherent cache simulator"
)]
struct Args {
    /// drive the PEs round-robin, one instruction at a time
    #[arg(long)]
    step: bool,
    /// in step mode, dump the accumulators every K instructions
    #[arg(long, default_value_t = 8)]
    every: usize,
    /// number of vector elements (multiple of 4)
    #[arg(long, default_value_t = 16)]
    n: usize,
    /// print every MESI transition and bus emission
    #[arg(long)]
    trace: bool,
}

fn main() {
    let env = Env::default().filter_or("CACHESIM_LOG", "info");
    env_logger::init_from_env(env);

    let args = Args::parse();
    if args.n == 0 || args.n % NUM_PES != 0 {
        eprintln!("error: --n must be a positive multiple of {}", NUM_PES);
        std::process::exit(2);
    }
    if let Err(e) = run(&args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), SimError> {
    let n = args.n;
    let n_per_pe = n / NUM_PES;

    // one memory, one bus, four caches, four PEs
    let mem = Arc::new(MainMemory::new());
    let bus = Arc::new(Interconnect::new());
    let caches: Vec<Arc<Cache>> = (0..NUM_PES)
        .map(|i| {
            let c = Arc::new(Cache::new(i as u32, mem.clone()));
            c.attach_to_bus(&bus);
            bus.attach(&c);
            if args.trace {
                c.set_trace_hook(|line| println!("[trace] {}", line));
            }
            c
        })
        .collect();

    let a: Vec<f64> = (1..=n).map(|i| i as f64).collect();
    let b: Vec<f64> = vec![2.0; n];
    let layout = workload::layout(n, NUM_PES)?;
    workload::load_vectors(&mem, &layout, &a, &b, NUM_PES)?;

    let mut pes: Vec<ProcessingElement> = caches
        .iter()
        .enumerate()
        .map(|(i, c)| ProcessingElement::new(i as u32, c.clone()))
        .collect();
    for (i, pe) in pes.iter_mut().enumerate() {
        workload::configure_pe(pe, &layout, i, n_per_pe)?;
    }

    info!(
        "running {} elements across {} PEs ({} each), mode: {}",
        n,
        NUM_PES,
        n_per_pe,
        if args.step { "step" } else { "threads" }
    );

    if args.step {
        run_stepped(&mut pes, args.every)?;
    } else {
        pes = run_threaded(pes)?;
    }

    // write-back of everything still dirty so memory holds the results
    for c in &caches {
        c.flush_all()?;
    }

    let parallel = workload::collect_result(&mem, &layout, NUM_PES)?;
    let serial = workload::serial_dot(&a, &b);
    println!("parallel result:  {}", parallel);
    println!("serial reference: {}", serial);
    println!(
        "verdict: {}",
        if (parallel - serial).abs() < 1e-9 {
            "ok"
        } else {
            "MISMATCH"
        }
    );

    print_stats(&pes, &caches, &mem);
    if args.trace {
        for c in &caches {
            print!("{}", c.dump());
        }
    }
    Ok(())
}

fn run_threaded(pes: Vec<ProcessingElement>) -> Result<Vec<ProcessingElement>, SimError> {
    let handles: Vec<_> = pes
        .into_iter()
        .map(|mut pe| {
            thread::spawn(move || -> Result<ProcessingElement, SimError> {
                pe.run()?;
                Ok(pe)
            })
        })
        .collect();
    let mut out = Vec::with_capacity(handles.len());
    for h in handles {
        out.push(h.join().expect("PE thread panicked")?);
    }
    Ok(out)
}

fn run_stepped(pes: &mut [ProcessingElement], every: usize) -> Result<(), SimError> {
    let mut steps = 0usize;
    loop {
        let mut progressed = false;
        for i in 0..pes.len() {
            if pes[i].step()? {
                progressed = true;
                steps += 1;
                if every > 0 && steps % every == 0 {
                    let accs: Vec<String> = pes
                        .iter()
                        .map(|pe| {
                            format!("PE{}={}", pe.id(), pe.reg_double(4).unwrap_or(f64::NAN))
                        })
                        .collect();
                    println!("[step {}] {}", steps, accs.join("  "));
                }
            }
        }
        if !progressed {
            break;
        }
    }
    println!("all PEs done after {} instructions", steps);
    Ok(())
}

fn print_stats(pes: &[ProcessingElement], caches: &[Arc<Cache>], mem: &MainMemory) {
    println!();
    println!(
        "{:<6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>7} {:>7} {:>7} {:>7}",
        "cache", "hits", "miss", "fills", "wbs", "memR", "memW", "busRd", "busRdX", "snoopI",
        "snoopS", "snoopF"
    );
    for c in caches {
        let s = c.stats();
        println!(
            "C{:<5} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>7} {:>7} {:>7} {:>7}",
            c.id(),
            s.hits,
            s.misses,
            s.line_fills,
            s.writebacks,
            s.mem_reads,
            s.mem_writes,
            s.bus_rd,
            s.bus_rdx,
            s.snoop_to_i,
            s.snoop_to_s,
            s.snoop_flush
        );
    }
    for pe in pes {
        println!(
            "PE{}: loads={} stores={}",
            pe.id(),
            pe.read_ops(),
            pe.write_ops()
        );
    }
    println!("memory: reads={} writes={}", mem.read_count(), mem.write_count());
}
