use num_format::{Locale, ToFormattedString};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SLIDING_WINDOW_SIZE: u64 = 2; // In seconds

static STOP: AtomicBool = AtomicBool::new(false);

#[repr(C)]
#[derive(Default)]
struct WorkerStats {
    count: AtomicU64,
    /// Keeps each worker's counter on its own cache line.
    padding: [u64; 15],
}

/// Number of worker threads, taken from the first command line argument or
/// the number of physical cores.
pub fn num_threads() -> usize {
    let available = num_cpus::get();
    match env::args().nth(1).map(|arg| arg.parse::<usize>()) {
        Some(Ok(n)) if n > 0 && n <= available => n,
        Some(_) => {
            eprintln!("Invalid thread count, expected 1..={available}. Using all cores.");
            available
        }
        None => num_cpus::get_physical(),
    }
}

/// Calls `func` in a tight loop on every worker thread and prints the
/// aggregate throughput until Ctrl-C is pressed.
pub fn test_throughput<F>(func: F)
where
    F: Fn() + Sync + Send + 'static,
{
    ctrlc::set_handler(move || {
        STOP.store(true, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let num_threads = num_threads();
    println!("Number of threads: {num_threads}\n");
    let func_arc = Arc::new(func);
    let worker_stats_shared: Arc<Vec<WorkerStats>> =
        Arc::new((0..num_threads).map(|_| WorkerStats::default()).collect());

    let mut handles = Vec::with_capacity(num_threads + 1);

    let monitor_stats = Arc::clone(&worker_stats_shared);
    handles.push(thread::spawn(move || {
        let mut last_collect_time = Instant::now();
        let mut total_count_old: u64 = 0;
        loop {
            let elapsed = last_collect_time.elapsed().as_secs();
            if elapsed >= SLIDING_WINDOW_SIZE {
                let total_count_u64: u64 = monitor_stats
                    .iter()
                    .map(|worker_stat| worker_stat.count.load(Ordering::Relaxed))
                    .sum();
                last_collect_time = Instant::now();
                let current_count = total_count_u64 - total_count_old;
                total_count_old = total_count_u64;
                let throughput = current_count / elapsed;
                println!(
                    "Throughput: {} iterations/sec",
                    throughput.to_formatted_string(&Locale::en)
                );
            }

            if STOP.load(Ordering::SeqCst) {
                break;
            }

            thread::sleep(Duration::from_millis(5000));
        }
    }));

    for thread_index in 0..num_threads {
        let worker_stats_shared = Arc::clone(&worker_stats_shared);
        let func_arc_clone = Arc::clone(&func_arc);
        handles.push(thread::spawn(move || loop {
            for _ in 0..1000 {
                func_arc_clone();
            }
            worker_stats_shared[thread_index]
                .count
                .fetch_add(1000, Ordering::Relaxed);
            if STOP.load(Ordering::SeqCst) {
                break;
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}
