//! Status Polling Example
//!
//! This script opens every connected Helios DAC, prints its name and firmware
//! version, then streams a rotating line to the first device for three
//! seconds, polling the buffer status before every frame.
//!
//! The status is expected to report "not ready" while the device buffer is
//! full; the loop simply polls again.

use std::thread;
use std::time::{Duration, Instant};

use helios_dac::{Frame, FrameFlags, HeliosDac, Point};

fn main() {
    env_logger::init();

    match run() {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn line_frame(angle: f64) -> Frame {
    let (sin, cos) = angle.sin_cos();
    let start_x = (2048.0 - cos * 2000.0) as u16;
    let start_y = (2048.0 - sin * 2000.0) as u16;

    // Move to the start of the line with the beam off
    let mut points = vec![Point::blanked(start_x, start_y); 10];
    points.extend((0..500).map(|n| {
        let t = n as f64 / 499.0 * 2.0 - 1.0;
        let x = 2048.0 + t * cos * 2000.0;
        let y = 2048.0 + t * sin * 2000.0;
        Point::new(x as u16, y as u16, 0, 255, 0, 255)
    }));
    Frame::new(25000, points)
}

fn run() -> helios_dac::Result<i32> {
    println!("{}", "=".repeat(60));
    println!("Helios Status Polling Test");
    println!("{}", "=".repeat(60));
    println!();

    println!("Scanning for Helios devices...");
    let mut dac = HeliosDac::new()?;
    let count = dac.open_devices()?;
    if count == 0 {
        println!("ERROR: No Helios device found");
        return Ok(1);
    }

    for index in 0..count {
        println!(
            "Device {}: '{}' (firmware {})",
            index,
            dac.get_name(index)?,
            dac.get_firmware_version(index)?
        );
    }
    println!();

    println!("{}", "-".repeat(60));
    println!("Streaming to device 0 for 3 seconds...");
    println!("{}", "-".repeat(60));

    dac.set_shutter(0, true)?;

    let start_time = Instant::now();
    let mut frames = 0u32;
    let mut not_ready = 0u32;

    while start_time.elapsed() < Duration::from_secs(3) {
        if dac.get_status(0)?.is_ready() {
            let angle = start_time.elapsed().as_secs_f64();
            let frame = line_frame(angle).with_flags(FrameFlags::START_IMMEDIATELY);
            dac.write_frame(0, &frame)?;
            frames += 1;
        } else {
            not_ready += 1;
            thread::sleep(Duration::from_millis(1));
        }
    }

    println!("Frames written: {}", frames);
    println!("Not-ready polls: {}", not_ready);
    println!();

    dac.stop(0)?;
    dac.set_shutter(0, false)?;
    println!("Device stopped");

    dac.close_devices();
    Ok(0)
}
