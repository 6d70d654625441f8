//! Thin dispatcher around the protection engine: collects paths and
//! arguments, invokes one engine operation, reports the outcome and the
//! child's exit code.

use std::env;
use std::process;

use anyhow::{bail, Result};

use hw_protector::{
    anti_debug, fingerprint, patcher, protector,
};

const USAGE: &str = "\
usage:
  protector key
  protector encrypt <input> <output> [secret]
  protector decrypt <input> <output> [secret]
  protector run <envelope> [args...]
  protector protect <input> <output>
  protector execute <container> [args...]
  protector patch <input> <output>
  protector embed <host> <payload> <output>
  protector run-embedded <wrapper> [args...]

With no [secret], encrypt/decrypt key off this machine's fingerprint.";

fn main() {
    env_logger::init();
    match dispatch() {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn secret_or_fingerprint(explicit: Option<&String>) -> Result<String> {
    match explicit {
        Some(s) => Ok(s.clone()),
        None => Ok(fingerprint::generate_fingerprint()?),
    }
}

fn dispatch() -> Result<i32> {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!("{USAGE}");
    };

    if anti_debug::debugger_frontend_running() {
        log::warn!("analysis tooling is running on this machine");
    }

    match (command.as_str(), &args[1..]) {
        ("key", []) => {
            println!("{}", fingerprint::generate_fingerprint()?);
            Ok(0)
        }
        ("encrypt", rest @ [input, output, ..]) if rest.len() <= 3 => {
            let secret = secret_or_fingerprint(rest.get(2))?;
            protector::encrypt_file(input, output, &secret)?;
            Ok(0)
        }
        ("decrypt", rest @ [input, output, ..]) if rest.len() <= 3 => {
            let secret = secret_or_fingerprint(rest.get(2))?;
            protector::decrypt_file(input, output, &secret)?;
            Ok(0)
        }
        ("run", [envelope, run_args @ ..]) => {
            let code = protector::decrypt_and_run_with_hardware_key(envelope, run_args)?;
            Ok(code)
        }
        ("protect", [input, output]) => {
            protector::protect_file_for_this_machine(input, output)?;
            Ok(0)
        }
        ("execute", [container, run_args @ ..]) => {
            let code = protector::execute_protected(container, run_args)?;
            Ok(code)
        }
        ("patch", [input, output]) => {
            let data = std::fs::read(input)?;
            let patched = patcher::patch(&data)?;
            std::fs::write(output, patched)?;
            println!("patched {input} -> {output}");
            Ok(0)
        }
        ("embed", [host, payload, output]) => {
            let key = fingerprint::generate_fingerprint()?;
            protector::embed_file(host, payload, output, &key)?;
            Ok(0)
        }
        ("run-embedded", [wrapper, run_args @ ..]) => {
            let code = protector::run_embedded(wrapper, run_args)?;
            Ok(code)
        }
        _ => bail!("{USAGE}"),
    }
}
