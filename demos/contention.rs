//! Several clients competing for the shared budget, one of them turning rogue

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gemsched::prelude::*;

const CLIENTS: usize = 4;
const SUBMISSIONS: usize = 20;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    println!("gemsched contention");
    println!("===================\n");

    let (device, sim) = Device::simulated(DeviceConfig::testing())?;
    let device = Arc::new(device);
    device.apply_control("sharedt=20 sharedc=10 roguel=2 roguet=50 roguec=5")?;

    let mut workers = Vec::new();
    for n in 0..CLIENTS {
        let device = Arc::clone(&device);
        let sim = Arc::clone(&sim);
        workers.push(thread::spawn(move || -> GemResult<(ClientId, Duration)> {
            let client = device.open_client(PriorityClass::Normal)?;
            let batch = device.create_object(client, 4096)?;
            let args = SubmitArgs::new(EngineId::Render, vec![ExecObject::new(batch)], 64);
            let started = Instant::now();
            for _ in 0..SUBMISSIONS {
                device.submit(client, &args)?;
                // The first client keeps the engine busy far longer than the rest.
                if n == 0 {
                    sim.pause(EngineId::Render);
                    thread::sleep(Duration::from_millis(3));
                    sim.resume(EngineId::Render);
                }
            }
            device.wait_rendering(client, batch, false, Duration::from_secs(5))?;
            Ok((client, started.elapsed()))
        }));
    }

    for worker in workers {
        match worker.join() {
            Ok(Ok((client, elapsed))) => println!("{} finished in {:?}", client, elapsed),
            Ok(Err(e)) => println!("client failed: {}", e),
            Err(_) => println!("client thread panicked"),
        }
    }

    println!();
    print!("{}", device.control_snapshot());
    Ok(())
}
