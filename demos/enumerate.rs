//! List attached Kinect devices with their tilt state.

use kinect_bridge::{frame_channel, LedState};

fn main() {
    env_logger::init();

    let driver = match kinect_bridge::init() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("Found {} device(s):", driver.device_count());
    for index in 0..driver.device_count() {
        let (listener, _frames) = frame_channel(1);
        if let Err(e) = driver.open(index, listener) {
            println!("  [{}] open failed: {}", index, e);
            continue;
        }

        match driver.tilt_state(index) {
            Ok(state) => {
                let a = state.accelerometer_mks();
                println!(
                    "  [{}] tilt={:+.1} deg  status={:?}  accel=[{:+.2}, {:+.2}, {:+.2}] m/s^2",
                    index,
                    state.degrees(),
                    state.status,
                    a[0],
                    a[1],
                    a[2]
                );
            }
            Err(e) => println!("  [{}] tilt state unavailable: {}", index, e),
        }

        let _ = driver.set_led(index, LedState::Green);
        let _ = driver.close(index);
    }

    driver.shutdown();
}
