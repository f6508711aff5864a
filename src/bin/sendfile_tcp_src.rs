use std::{env::args, str::FromStr};

use rand::Rng;
use sendfleet::{run_fleet, FleetConfig};

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();
    println!("sendfile tcp src");

    let connections = args().nth(1).unwrap_or("4".to_string());
    let connections = usize::from_str(&connections)?;
    let host = args().nth(2).unwrap_or("localhost".to_string());
    let port = args().nth(3).unwrap_or("1234".to_string());
    let input_path = match args().nth(4) {
        Some(path) => path,
        None => generate_payload(16 * 1024 * 1024)?,
    };
    let output_template = args().nth(5);
    let half_close = args().nth(6).unwrap_or("true".to_string());
    let half_close = bool::from_str(&half_close)?;

    let cfg = FleetConfig {
        input_path,
        discard_responses: output_template.is_none(),
        output_template: output_template.unwrap_or_default(),
        host,
        port,
        connections,
        half_close,
        fast_open: false,
    };

    let results = run_fleet(&cfg)?;

    let mut failed = 0usize;
    let mut window_start = u64::MAX;
    let mut window_end = 0u64;
    let mut total_bytes = 0u64;
    for (i, outcome) in results.iter().enumerate() {
        match outcome {
            Ok(s) => {
                println!(
                    "#{} connect {:.3} ms, send {:.3} ms ({} bytes), receive {:.3} ms ({} bytes)",
                    i + 1,
                    ms(s.connect_start_ns, s.connect_end_ns),
                    ms(s.send_start_ns, s.send_end_ns),
                    s.total_sent,
                    ms(s.receive_start_ns, s.receive_end_ns),
                    s.total_received,
                );
                window_start = window_start.min(s.connect_start_ns);
                window_end = window_end.max(s.receive_end_ns.max(s.send_end_ns));
                total_bytes += s.total_sent + s.total_received;
            }
            Err(e) => {
                failed += 1;
                println!("#{} failed: {e}", i + 1);
            }
        }
    }

    if window_end > window_start {
        let secs = (window_end - window_start) as f64 / 1.0e9;
        let gbit = 8.0 * total_bytes as f64 / 1.0e9 / secs;
        println!(
            "{} bytes on the wire in {secs:.3} s ({gbit:.2} GBit/s)",
            total_bytes
        );
    }

    if failed > 0 {
        eyre::bail!("{failed}/{} connections failed", results.len());
    }
    Ok(())
}

fn ms(start_ns: u64, end_ns: u64) -> f64 {
    (end_ns.saturating_sub(start_ns)) as f64 / 1.0e6
}

fn generate_payload(len: usize) -> eyre::Result<String> {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    let path = std::env::temp_dir().join(format!("sendfleet-payload-{}", std::process::id()));
    std::fs::write(&path, &data)?;
    println!("generated {len} byte payload at {}", path.display());
    Ok(path.to_string_lossy().into_owned())
}
