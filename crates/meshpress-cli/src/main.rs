use anyhow::{bail, Context, Result};
use meshpress_core::{execute, OptimizeOptions, Preset, ProgressEvent};
use std::env;
use std::path::PathBuf;

fn main() -> Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        println!(
            "Usage: meshpress <input.glb> <output.glb> [--preset fast|balanced|maximum] [--options options.json] [--quiet]"
        );
        return Ok(());
    }

    let input = PathBuf::from(&args[1]);
    let output = PathBuf::from(&args[2]);
    let mut options = OptimizeOptions::default();
    let mut quiet = false;

    let mut i = 3;
    while i < args.len() {
        match args[i].as_str() {
            "--preset" => {
                let name = args
                    .get(i + 1)
                    .context("--preset requires a name")?;
                let preset = Preset::from_name(name)
                    .with_context(|| format!("unknown preset: {name}"))?;
                options = OptimizeOptions::preset(preset);
                i += 2;
            }
            "--options" => {
                let path = args
                    .get(i + 1)
                    .context("--options requires a file path")?;
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read options file: {path}"))?;
                options = OptimizeOptions::from_json(&json)?;
                i += 2;
            }
            "--quiet" => {
                quiet = true;
                i += 1;
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    println!("Optimizing {}...", input.display());
    let mut on_progress = |event: &ProgressEvent| {
        if !quiet {
            match event.duration_ms {
                Some(ms) => println!(
                    "  [{}/{}] {} {:?} ({ms}ms)",
                    event.index + 1,
                    event.total,
                    event.step,
                    event.status
                ),
                None => println!(
                    "  [{}/{}] {} {:?}",
                    event.index + 1,
                    event.total,
                    event.step,
                    event.status
                ),
            }
        }
    };

    let report = execute(&input, &output, &options, Some(&mut on_progress))?;

    if report.success {
        println!(
            "Done in {}ms: {} -> {} bytes ({:.1}%)",
            report.processing_time_ms,
            report.original_size,
            report.optimized_size,
            report.compression_ratio * 100.0
        );
        println!("Saved to {}", output.display());
    } else if report.cancelled {
        bail!("optimization cancelled");
    } else {
        for step in &report.steps {
            if let Some(error) = &step.error {
                eprintln!("step {} failed: {error}", step.step);
            }
        }
        bail!(
            "optimization failed at step {}",
            report.failed_step.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}
