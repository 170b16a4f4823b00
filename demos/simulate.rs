//! Drive the bridge against simulated hardware.
//!
//! Usage: cargo run --example simulate

use kinect_bridge::{frame_channel, DriverHandle, RustHost, SimulatedBackend, StreamKind};
use std::time::Duration;

fn main() {
    env_logger::init();

    let sim = SimulatedBackend::new(2);
    let driver = match DriverHandle::init(sim.clone(), RustHost) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    let (listener, frames) = frame_channel(8);
    if let Err(e) = driver
        .open(0, listener)
        .and_then(|()| driver.start_video(0))
        .and_then(|()| driver.start_depth(0))
    {
        eprintln!("Failed to start streams: {}", e);
        std::process::exit(1);
    }

    for _ in 0..5 {
        sim.inject_synthetic_frame(0, StreamKind::Video);
        sim.inject_synthetic_frame(0, StreamKind::Depth);
    }

    while let Ok(frame) = frames.recv_timeout(Duration::from_millis(200)) {
        println!("{:>5} frame: {} bytes", frame.stream.to_string(), frame.data.len());
    }

    let _ = driver.set_tilt_degrees(0, 15.0);
    if let Ok(state) = driver.tilt_state(0) {
        println!("tilt: {:+.1} deg", state.degrees());
    }

    let _ = driver.close(0);
    driver.shutdown();
    println!("{} polls, {} frames delivered", sim.polls(), sim.frames_delivered());
}
