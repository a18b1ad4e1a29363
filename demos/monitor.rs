use std::{env, thread, time::Duration};

use servo_link::{ServoParams, ServoSession};

fn main() {
    env_logger::init();

    let path = env::args().nth(1).expect("no serial port supplied");
    let port = serialport::new(path, 38_400)
        .timeout(Duration::from_millis(20))
        .open()
        .expect("failed to open serial port");

    let mut servo = ServoSession::new(port);
    servo.params(&ServoParams::default());

    loop {
        match servo.poll() {
            Ok(updates) => {
                if !updates.is_empty() {
                    println!("{:?}", servo.telemetry());
                }
                if servo.fault() {
                    eprintln!("overcurrent fault reported");
                }
            }
            Err(err) => {
                eprintln!("{err}");
                break;
            }
        }

        // Neutral drive keeps the link and the parameter schedule running.
        servo.command(0.0);
        thread::sleep(Duration::from_millis(10));
    }
}
