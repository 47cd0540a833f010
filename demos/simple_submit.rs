//! Submit a batch with one relocation on a simulated device and read the patch back

use std::time::Duration;

use gemsched::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    println!("gemsched simple submit");
    println!("======================\n");

    let (device, sim) = Device::simulated(DeviceConfig::testing())?;
    let client = device.open_client(PriorityClass::Normal)?;

    let target = device.create_object(client, 64 * 1024)?;
    let batch = device.create_object(client, 4096)?;
    println!("Created {} (target) and {} (batch) for {}", target, batch, client);

    // The batch points at the target through the dword at offset 16.
    let reloc = Relocation::new(target, 16, Domains::RENDER).with_delta(0x40);
    let args = SubmitArgs::new(
        EngineId::Render,
        vec![
            ExecObject::new(target).with_flags(ExecObjectFlags::WRITE),
            ExecObject::new(batch).with_relocation(reloc),
        ],
        64,
    );

    let seqno = device.submit(client, &args)?;
    println!("Submitted seqno {} on {}", seqno, EngineId::Render);

    device.wait_rendering(client, target, false, Duration::from_secs(1))?;
    let patched = device.read_object(client, batch, 16, 4)?;
    let value = u32::from_le_bytes([patched[0], patched[1], patched[2], patched[3]]);
    let placed = device
        .binding(client, target)?
        .map(|b| b.offset)
        .unwrap_or_default();

    println!("Target bound at {:#x}, batch patched with {:#x}", placed, value);
    println!("Engine completed seqno {}", sim.completed_seqno(EngineId::Render));
    for executed in sim.executed_batches() {
        println!(
            "  {} ran {} bytes at {:#x}",
            executed.engine, executed.length, executed.address
        );
    }

    device.close_client(client)?;
    println!("\nObjects left after close: {}", device.object_count());
    Ok(())
}
