use std::process::Command;

fn troll(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_troll")).args(args).output().expect("Failed to run troll")
}

#[test]
fn test_cli_help() {
    let output = troll(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: troll"));
    assert!(stdout.contains("flash"));
}

#[test]
fn test_core_regs_from_dumps() {
    let dir = std::env::temp_dir();
    let id = std::process::id();
    let rom = dir.join(format!("troll-cli-{id}-rom.bin"));
    let ram = dir.join(format!("troll-cli-{id}-ram.bin"));
    let regs = dir.join(format!("troll-cli-{id}-regs.bin"));
    std::fs::write(&rom, [0x11u8; 32]).unwrap();
    std::fs::write(&ram, [0x22u8; 32]).unwrap();
    let registers: Vec<u8> = (0..17u32).flat_map(|r| (0x0800_0000 + r).to_le_bytes()).collect();
    std::fs::write(&regs, registers).unwrap();

    let paths = [rom.to_str().unwrap(), ram.to_str().unwrap(), regs.to_str().unwrap()];
    let output = troll(&["core", paths[0], paths[1], paths[2], "regs"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("R15: 0x0800000F"));

    let output = troll(&["core", paths[0], paths[1], paths[2], "read", "0x20000000", "4"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("0x20000000: 22222222"));

    let output = troll(&["core", paths[0], paths[1], paths[2], "read", "0x30000000", "4"]);
    assert!(!output.status.success());

    for path in [rom, ram, regs] {
        let _ = std::fs::remove_file(path);
    }
}
