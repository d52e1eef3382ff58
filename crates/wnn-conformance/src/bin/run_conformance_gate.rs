#![forbid(unsafe_code)]

use std::path::PathBuf;
use wnn_conformance::{HarnessConfig, run_all_core_suites, run_smoke, set_reduce_log_path};

#[derive(Debug, Default)]
struct GateOptions {
    fixture_root: Option<PathBuf>,
    report_root: Option<PathBuf>,
    log_path: Option<PathBuf>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("run_conformance_gate failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let options = parse_args()?;
    let mut cfg = HarnessConfig::default_paths().with_env_overrides();
    if let Some(root) = options.fixture_root {
        cfg.fixture_root = root;
    }
    if let Some(root) = options.report_root {
        cfg.report_root = root;
    }
    if options.log_path.is_some() {
        set_reduce_log_path(options.log_path);
    }

    let smoke = run_smoke(&cfg);
    if !smoke.fixtures_present {
        return Err(format!(
            "fixture root {} does not exist",
            cfg.fixture_root.display()
        ));
    }
    println!(
        "smoke: fixtures={} strict_mode={}",
        smoke.fixture_count, smoke.strict_mode
    );

    let suites = run_all_core_suites(&cfg)?;
    let mut failed = 0usize;
    for suite in &suites {
        println!(
            "{}: cases={} passed={} failed={}",
            suite.suite,
            suite.case_count,
            suite.pass_count,
            suite.case_count.saturating_sub(suite.pass_count)
        );
        for failure in &suite.failures {
            eprintln!("  {failure}");
        }
        if !suite.all_passed() {
            failed += 1;
        }
    }
    println!("wrote {}", cfg.report_root.display());

    if failed > 0 {
        return Err(format!("{failed} suite(s) failed"));
    }
    Ok(())
}

fn parse_args() -> Result<GateOptions, String> {
    let mut options = GateOptions::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fixture-root" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--fixture-root requires a value".to_string())?;
                options.fixture_root = Some(PathBuf::from(value));
            }
            "--report-root" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--report-root requires a value".to_string())?;
                options.report_root = Some(PathBuf::from(value));
            }
            "--log-path" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--log-path requires a value".to_string())?;
                options.log_path = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p wnn-conformance --bin run_conformance_gate -- [--fixture-root <dir>] [--report-root <dir>] [--log-path <file>]"
                );
                std::process::exit(0);
            }
            unknown => return Err(format!("unknown argument: {unknown}")),
        }
    }
    Ok(options)
}
