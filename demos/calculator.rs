//! Example Calculator Host (creator + workers)
//!
//! Creates a segment and serves `add` and `subtract` on two worker threads
//! until the input queue stays idle for the poll budget.

use serde_json::{json, Value};
use std::time::Duration;
use venom_queue::{HandlerError, Poller, Segment, SegmentConfig, Worker};

fn number(args: &Value, name: &str) -> Result<f64, HandlerError> {
    args.get(name)
        .ok_or_else(|| HandlerError::MissingArgument(name.to_string()))?
        .as_f64()
        .ok_or_else(|| HandlerError::InvalidArgument {
            name: name.to_string(),
            reason: "not a number".into(),
        })
}

fn main() {
    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "venom_calc".to_string());

    println!("╔══════════════════════════════════════════════════╗");
    println!("║          VenomQueue Calculator Host              ║");
    println!("╚══════════════════════════════════════════════════╝");
    println!();

    let segment = match Segment::create(&name, &SegmentConfig::default()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[Host] Failed to create segment: {}", e);
            std::process::exit(1);
        }
    };
    println!("[Host] Segment '{}' ready, serving add/subtract", name);

    // Stop after 30 s without work
    let poller = Poller::attempts(Duration::from_millis(100), 300);

    std::thread::scope(|s| {
        s.spawn(|| {
            let mut worker = Worker::new(&segment, "add", |args: &Value| {
                Ok::<_, HandlerError>(json!(number(args, "a")? + number(args, "b")?))
            });
            match worker.serve(&poller) {
                Ok(stats) => println!("[add] done: {:?}", stats),
                Err(e) => eprintln!("[add] stopped: {}", e),
            }
        });
        s.spawn(|| {
            let mut worker = Worker::new(&segment, "subtract", |args: &Value| {
                Ok::<_, HandlerError>(json!(number(args, "a")? - number(args, "b")?))
            });
            match worker.serve(&poller) {
                Ok(stats) => println!("[subtract] done: {:?}", stats),
                Err(e) => eprintln!("[subtract] stopped: {}", e),
            }
        });
    });

    if let Err(e) = segment.teardown() {
        eprintln!("[Host] Teardown failed: {}", e);
    }
    println!("[Host] Goodbye");
}
