//! nanovm CLI tool
//!
//! A command-line interface for booting a Linux guest under KVM.

use std::process;

use nanovm::kvm::KvmSession;
use nanovm::VmmBuilder;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        return Ok(());
    }

    match args[1].as_str() {
        "run" => cmd_run(&args[2..])?,
        "info" => cmd_info()?,
        "help" | "--help" | "-h" => print_usage(&args[0]),
        "version" | "--version" | "-V" => print_version(),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage(&args[0]);
            process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program: &str) {
    println!(
        r#"nanovm - a minimal KVM virtual machine monitor

USAGE:
    {} <COMMAND> [OPTIONS]

COMMANDS:
    run     Boot a Linux guest
    info    Show hypervisor information
    help    Show this help message
    version Show version information

RUN OPTIONS:
    --kernel <PATH>     Path to a bzImage kernel (required)
    --cmdline <STRING>  Kernel command line (default: "earlyprintk=ttyS0,keep")
    --memory <MB>       Guest memory size in MB (default: 1024)

EXAMPLES:
    {} run --kernel /boot/vmlinuz-linux
    {} run --kernel vmlinuz --cmdline "earlyprintk=ttyS0,keep" --memory 512
"#,
        program, program, program
    );
}

fn print_version() {
    println!("nanovm {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_info() -> Result<(), Box<dyn std::error::Error>> {
    println!("Hypervisor Information");
    println!("======================");

    if !nanovm::kvm_available() {
        println!("Status: Not available");
        println!("Note: /dev/kvm is missing; KVM may be disabled or unsupported.");
        return Ok(());
    }

    let session = KvmSession::open()?;
    println!("Status: Available");
    println!("API version: {}", session.api_version());
    println!("vCPU state size: {} bytes", session.vcpu_state_size()?);
    println!(
        "Supported CPUID entries: {}",
        session.supported_cpu_features()?.as_slice().len()
    );

    Ok(())
}

fn cmd_run(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let mut kernel: Option<String> = None;
    let mut cmdline = String::from("earlyprintk=ttyS0,keep");
    let mut memory_mb: u64 = 1024;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--kernel" => {
                kernel = Some(expect_value(args, &mut i, "--kernel")?);
            }
            "--cmdline" => {
                cmdline = expect_value(args, &mut i, "--cmdline")?;
            }
            "--memory" => {
                memory_mb = expect_value(args, &mut i, "--memory")?.parse()?;
            }
            other => {
                return Err(format!("unknown option: {}", other).into());
            }
        }
        i += 1;
    }

    let kernel = kernel.ok_or("missing required option: --kernel <PATH>")?;

    let mut vmm = VmmBuilder::new(kernel)
        .cmdline(cmdline)
        .memory_bytes(memory_mb * 1024 * 1024)
        .build()?;

    // Runs for the lifetime of the guest; only a fatal error returns.
    vmm.run()?;

    Ok(())
}

fn expect_value(args: &[String], i: &mut usize, option: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("option {} requires a value", option))
}
