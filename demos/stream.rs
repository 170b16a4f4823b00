//! Stream color and depth frames from the first Kinect and report rates.
//!
//! Usage: cargo run --example stream --features libfreenect
//! Press Ctrl+C to stop.

use kinect_bridge::{frame_channel, BridgeError, StreamKind};
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();

    let driver = match kinect_bridge::init() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Failed to initialize: {}", e);
            std::process::exit(1);
        }
    };
    if driver.device_count() == 0 {
        eprintln!("No devices found");
        std::process::exit(1);
    }

    let (listener, frames) = frame_channel(16);
    let started = driver
        .open(0, listener)
        .and_then(|()| driver.start_video(0))
        .and_then(|()| driver.start_depth(0));
    if let Err(e) = started {
        eprintln!("Failed to start streams: {}", e);
        std::process::exit(1);
    }

    println!("Streaming (Ctrl+C to stop)...");

    let start = Instant::now();
    let mut video: u64 = 0;
    let mut depth: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        match frames.recv_timeout(Duration::from_secs(2)) {
            Ok(frame) => {
                match frame.stream {
                    StreamKind::Video => video += 1,
                    StreamKind::Depth => depth += 1,
                }

                let now = Instant::now();
                if now.duration_since(last_report) >= Duration::from_secs(3) {
                    let elapsed = start.elapsed().as_secs_f64();
                    println!(
                        "--- video {:.1} Hz, depth {:.1} Hz ({} bytes last frame) ---",
                        video as f64 / elapsed,
                        depth as f64 / elapsed,
                        frame.data.len()
                    );
                    last_report = now;
                }
            }
            Err(BridgeError::Timeout) => {
                eprintln!("Timeout waiting for frames");
                break;
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        }
    }

    let _ = driver.close(0);
    driver.shutdown();
    println!("\nTotal: {} video, {} depth frames", video, depth);
}
