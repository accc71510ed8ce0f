use troll_core::ProbeManager;

fn main() -> anyhow::Result<()> {
    let probes = ProbeManager::default().list_probes()?;
    println!("Found {} probes:", probes.len());
    for (i, info) in probes.iter().enumerate() {
        println!("{}: {} (Serial: {:?})", i, info.name(), info.serial_number);
    }
    Ok(())
}
