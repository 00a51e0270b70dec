//! Example Caller
//!
//! Attaches to a calculator host's segment and issues calls.

use serde_json::json;
use std::time::Instant;
use venom_queue::{Client, Segment};

fn main() {
    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "venom_calc".to_string());

    let segment = match Segment::attach(&name) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[Caller] Failed to attach: {}", e);
            eprintln!("[Caller] Make sure the calculator host is running first!");
            std::process::exit(1);
        }
    };
    let client = Client::new(&segment);

    for (function, a, b) in [("add", 10, 4), ("subtract", 10, 4), ("add", -3, 3)] {
        let start = Instant::now();
        match client.call(function, json!({"a": a, "b": b})) {
            Ok(result) => println!(
                "[Caller] {}({}, {}) = {} in {:?}",
                function,
                a,
                b,
                result,
                start.elapsed()
            ),
            Err(e) => eprintln!("[Caller] {}({}, {}) failed: {}", function, a, b, e),
        }
    }

    // Missing argument comes back as an error response
    match client.call("add", json!({"a": 1})) {
        Ok(result) => println!("[Caller] unexpected result {}", result),
        Err(e) => println!("[Caller] rejected as expected: {}", e),
    }
}
