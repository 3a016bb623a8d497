use std::{
    cell::RefCell,
    ops::DerefMut,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Barrier,
    },
    time::{Duration, Instant},
};

use lazy_static::lazy_static;
use num_format::{Locale, ToFormattedString};
use opentelemetry::KeyValue;
use opentelemetry_metrics_pipeline::{
    metrics::{
        data::ResourceMetrics, Histogram, ManualReader, MetricReader, SdkMeterProvider,
        Temporality,
    },
    CollectContext,
};

use rand::{rngs::SmallRng, Rng, SeedableRng};

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTemporality {
    Cumulative,
    Delta,
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Measure metrics performance while collecting",
    long_about = "Measures how much recording slows down while a collection runs.\n\
    Recording must keep making progress during the collection phase; the\n\
    numbers below show how many measurements land while collecting."
)]
struct Cli {
    /// Select collection phase temporality
    temporality: CliTemporality,

    /// How long to run, in seconds
    #[arg(long, default_value_t = 3)]
    seconds: u64,
}

lazy_static! {
    pub static ref ATTRIBUTE_VALUES: [&'static str; 10] = [
        "value1", "value2", "value3", "value4", "value5", "value6", "value7", "value8", "value9",
        "value10"
    ];
}

thread_local! {
    /// Store random number generator for each thread
    pub static CURRENT_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_os_rng());
}

fn main() {
    let cli = Cli::parse();
    let temporality = match cli.temporality {
        CliTemporality::Cumulative => Temporality::Cumulative,
        CliTemporality::Delta => Temporality::Delta,
    };
    let reader = ManualReader::builder()
        .with_temporality(temporality)
        .build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader.clone())
        .build();
    // histograms take the longest to snapshot
    let histogram = provider.meter("test").u64_histogram("hello").build();

    measure_collection_interference(
        histogram,
        reader,
        Duration::from_secs(cli.seconds),
    )
    .print();
}

fn record(histogram: &Histogram<u64>) {
    CURRENT_RNG.with(|rng| {
        histogram.record(
            1,
            &random_attribute_set3(rng.borrow_mut().deref_mut(), ATTRIBUTE_VALUES.as_ref()),
        );
    });
}

fn measure_collection_interference(
    histogram: Histogram<u64>,
    reader: ManualReader,
    duration: Duration,
) -> CollectionStats {
    // Leave the other half of the cores to the OS so measurements stay stable.
    let num_threads = (num_cpus::get() / 2).max(2);

    let mut res = CollectionStats::default();
    let start = Instant::now();
    while start.elapsed() < duration {
        res.iterations += 1;
        let is_collecting = AtomicBool::new(false);
        let recorded = AtomicUsize::new(0);
        let micros = AtomicUsize::new(0);
        let barrier = Barrier::new(num_threads + 1);
        std::thread::scope(|s| {
            // fill the aggregators first so the collection is not empty
            let handles: Vec<_> = (0..num_threads)
                .map(|_| {
                    s.spawn(|| {
                        for _ in 0..1000 {
                            record(&histogram);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            // record on all but one thread for as long as the collection runs
            for _ in 0..num_threads - 1 {
                s.spawn(|| {
                    barrier.wait();
                    let now = Instant::now();
                    let mut count = 0;
                    while is_collecting.load(Ordering::Acquire) {
                        record(&histogram);
                        count += 1;
                    }
                    recorded.fetch_add(count, Ordering::AcqRel);
                    micros
                        .fetch_add(now.elapsed().as_micros() as usize, Ordering::AcqRel);
                });
            }

            let collect_handle = s.spawn(|| {
                let mut rm = ResourceMetrics::default();
                is_collecting.store(true, Ordering::Release);
                barrier.wait();
                reader.collect(&CollectContext::new(), &mut rm).unwrap();
                is_collecting.store(false, Ordering::Release);
            });
            barrier.wait();
            collect_handle.join().unwrap();
        });
        res.recorded_while_collecting += recorded.load(Ordering::Acquire);
        res.micros_collecting += micros.load(Ordering::Acquire);
    }
    res
}

#[derive(Default)]
struct CollectionStats {
    recorded_while_collecting: usize,
    micros_collecting: usize,
    iterations: usize,
}

impl CollectionStats {
    fn print(&self) {
        let iterations = self.iterations.max(1) as f64;
        let millis = (self.micros_collecting as f64 / 1000.0).max(f64::EPSILON);
        println!(
            "Iterations: {}",
            self.iterations.to_formatted_string(&Locale::en)
        );
        println!(
            "{:>10.2} measurements/ms while collecting",
            self.recorded_while_collecting as f64 / millis
        );
        println!(
            "{:>10.2} measurements/iteration",
            self.recorded_while_collecting as f64 / iterations
        );
        println!(
            "{:>10.2} μs recording time/iteration",
            self.micros_collecting as f64 / iterations
        );
    }
}

fn random_attribute_set3(rng: &mut SmallRng, values: &[&'static str]) -> [KeyValue; 3] {
    let len = values.len();
    [
        KeyValue::new("attribute1", values[rng.random_range(0..len)]),
        KeyValue::new("attribute2", values[rng.random_range(0..len)]),
        KeyValue::new("attribute3", values[rng.random_range(0..len)]),
    ]
}
