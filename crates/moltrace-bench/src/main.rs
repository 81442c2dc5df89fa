use std::path::PathBuf;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use moltrace_bench::report;
use moltrace_bench::runner::{BenchmarkRunner, GpuContext};
use moltrace_bench::scenes;
use moltrace_core::WorldConfig;

fn usage() {
    eprintln!("Usage: bench-runner [OPTIONS]");
    eprintln!("  --frames <n>                   Frames per scene (default: 60)");
    eprintln!("  --scene <name>                 Run one scene instead of the suite");
    eprintln!("  --config <path>                World config (RON)");
    eprintln!("  --gpu                          Also time GPU ray queries");
    eprintln!("  --save-baseline <path>         Save current results as JSON baseline");
    eprintln!("  --compare <path>               Load baseline JSON for comparison");
    eprintln!("  --regression-threshold <pct>   Regression threshold percentage (default: 10)");
}

fn fail(message: String) -> ! {
    eprintln!("{}", message);
    process::exit(1);
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i) {
        Some(v) => v,
        None => fail(format!("{} needs a value", flag)),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    let mut baseline_path: Option<PathBuf> = None;
    let mut output_path: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut scene_name: Option<String> = None;
    let mut regression_threshold = 10.0f64;
    let mut frame_count = 60u32;
    let mut use_gpu = false;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--compare" => {
                i += 1;
                baseline_path = Some(PathBuf::from(value(&args, i, flag)));
            }
            "--save-baseline" => {
                i += 1;
                output_path = Some(PathBuf::from(value(&args, i, flag)));
            }
            "--config" => {
                i += 1;
                config_path = Some(PathBuf::from(value(&args, i, flag)));
            }
            "--scene" => {
                i += 1;
                scene_name = Some(value(&args, i, flag).to_string());
            }
            "--regression-threshold" => {
                i += 1;
                regression_threshold = value(&args, i, flag)
                    .parse()
                    .unwrap_or_else(|_| fail("invalid --regression-threshold value".into()));
            }
            "--frames" => {
                i += 1;
                frame_count = value(&args, i, flag)
                    .parse()
                    .unwrap_or_else(|_| fail("invalid --frames value".into()));
            }
            "--gpu" => use_gpu = true,
            "--help" | "-h" => {
                usage();
                process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    let config = match &config_path {
        Some(path) => WorldConfig::load(path)
            .unwrap_or_else(|e| fail(format!("failed to load {}: {}", path.display(), e))),
        None => WorldConfig::default(),
    };

    let scene_configs = match &scene_name {
        Some(name) => match scenes::find_scene(name) {
            Some(scene) => vec![scene],
            None => {
                let names: Vec<&str> = scenes::standard_scenes().iter().map(|s| s.name).collect();
                fail(format!("Unknown scene '{}'. Available: {}", name, names.join(", ")));
            }
        },
        None => scenes::standard_scenes(),
    };

    let gpu = if use_gpu {
        log::info!("Initializing GPU...");
        match GpuContext::new() {
            Ok(context) => Some(context),
            Err(e) => {
                log::warn!("GPU queries disabled: {}", e);
                None
            }
        }
    } else {
        None
    };
    let runner = BenchmarkRunner::new(config, frame_count, gpu);

    let mut results = Vec::new();
    for scene in &scene_configs {
        match runner.run_scene(scene) {
            Ok(result) => results.push(result),
            Err(e) => fail(format!("scene '{}' failed: {}", scene.name, e)),
        }
    }

    println!("\n## Benchmark Results\n");
    println!("{}", report::format_markdown(&results));

    if let Some(ref path) = output_path {
        let baseline = report::Baseline {
            timestamp: timestamp(),
            results: results.clone(),
        };
        if let Err(e) = report::save_baseline(path, &baseline) {
            fail(format!("failed to save baseline {}: {}", path.display(), e));
        }
        log::info!("Saved baseline to {}", path.display());
    }

    if let Some(ref path) = baseline_path {
        if let Some(baseline) = report::load_baseline(path) {
            let regressions = report::compare(&results, &baseline, regression_threshold);
            println!(
                "{}",
                report::format_comparison(&regressions, regression_threshold)
            );
            if !regressions.is_empty() {
                eprintln!(
                    "ERROR: {} regressions detected, exiting with code 1",
                    regressions.len()
                );
                process::exit(1);
            }
        } else {
            log::warn!("Baseline file not found: {}", path.display());
        }
    }

    log::info!("Benchmark complete.");
}

/// Seconds since the Unix epoch.
fn timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("unix-{}", secs)
}
