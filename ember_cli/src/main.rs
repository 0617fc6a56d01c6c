use anyhow::{Context, bail};
use clap::Parser;
use ember_core::config::{
    EmberConfig, FuzzerSettings, InstrumentationSettings, MutatorSettings, TargetSettings,
};
use ember_core::instrumentation::{self, Instrumentation, InstrumentationKind};
use ember_core::mutator::{self, Mutator, MutatorError, MutatorKind};
use ember_core::{Checkpoint, FuzzResult};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Variants drawn from one queue entry before moving to the next, for
/// mutators without a schedule of their own.
const VARIANTS_PER_INPUT: u64 = 1024;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(long)]
    target_command: Option<String>,
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Directory receiving `queue/`, `crashes/` and `hangs/`.
    #[clap(short, long, default_value = "findings")]
    output_dir: PathBuf,
    /// Print the options of every instrumentation and mutator, then exit.
    #[clap(long)]
    list_kinds: bool,
}

fn list_kinds() {
    for kind in [InstrumentationKind::Dbt, InstrumentationKind::ReturnCode] {
        println!("instrumentation {}", kind.help());
    }
    println!("mutator {}", MutatorKind::Havoc.help());
}

fn load_config(cli: &Cli) -> anyhow::Result<EmberConfig> {
    let mut config = if let Some(path) = &cli.config_file {
        EmberConfig::load_from_file(path)?
    } else if Path::new("config.toml").exists() {
        info!("using ./config.toml");
        EmberConfig::load_from_file(Path::new("config.toml"))?
    } else {
        let Some(command) = &cli.target_command else {
            bail!("no config file found; pass --config-file or --target-command");
        };
        EmberConfig {
            target: TargetSettings {
                command: command.clone(),
                seed_paths: Vec::new(),
            },
            instrumentation: InstrumentationSettings::default(),
            mutator: MutatorSettings::default(),
            fuzzer: FuzzerSettings::default(),
        }
    };
    if let Some(command) = &cli.target_command {
        config.target.command = command.clone();
    }
    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = iterations;
    }
    Ok(config)
}

fn load_seeds(paths: &[PathBuf]) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut seeds = Vec::new();
    for path in paths {
        if path.is_file() {
            seeds.push(fs::read(path)?);
        } else if path.is_dir() {
            for entry in fs::read_dir(path)? {
                let file_path = entry?.path();
                if file_path.is_file() {
                    seeds.push(fs::read(&file_path)?);
                }
            }
        } else {
            warn!("seed path {path:?} does not exist");
        }
    }
    if seeds.is_empty() {
        seeds.push(b"INIT".to_vec());
    }
    Ok(seeds)
}

/// Stores `data` under `dir`, named by its digest so repeats collapse.
fn save_finding(dir: &Path, data: &[u8]) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{:x}", md5::compute(data)));
    if !path.exists() {
        fs::write(&path, data)?;
    }
    Ok(path)
}

fn save_checkpoint(
    path: &Path,
    backend: &dyn Instrumentation,
    mutator: &dyn Mutator,
) -> anyhow::Result<()> {
    let checkpoint = Checkpoint {
        instrumentation_kind: backend.kind().name().to_string(),
        instrumentation: backend.get_state()?,
        mutator_kind: mutator.kind().name().to_string(),
        mutator: mutator.get_state()?,
    };
    checkpoint
        .save(path)
        .with_context(|| format!("failed to write checkpoint {path:?}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    if cli.list_kinds {
        list_kinds();
        return Ok(());
    }

    let config = load_config(&cli)?;
    let instrumentation_kind = config.instrumentation.kind()?;
    let mutator_kind = config.mutator.kind()?;

    let checkpoint = match &config.fuzzer.checkpoint_path {
        Some(path) if path.exists() => {
            let checkpoint = Checkpoint::load(path)?;
            if checkpoint.instrumentation_kind != instrumentation_kind.name()
                || checkpoint.mutator_kind != mutator_kind.name()
            {
                bail!(
                    "checkpoint {path:?} was written by {}/{}, config asks for {}/{}",
                    checkpoint.instrumentation_kind,
                    checkpoint.mutator_kind,
                    instrumentation_kind,
                    mutator_kind
                );
            }
            info!("resuming from {path:?}");
            Some(checkpoint)
        }
        _ => None,
    };

    let mut seeds = load_seeds(&config.target.seed_paths)?;
    for seed in &mut seeds {
        seed.truncate(config.fuzzer.max_input_len);
    }
    let mut backend = instrumentation::create(
        instrumentation_kind,
        &config.instrumentation.options,
        checkpoint.as_ref().map(|c| c.instrumentation.as_slice()),
    )?;
    let mut mutator = mutator::create(
        mutator_kind,
        &config.mutator.options,
        checkpoint.as_ref().map(|c| c.mutator.as_slice()),
        &seeds[0],
    )?;

    let command = config.target.command.as_str();
    let queue_dir = cli.output_dir.join("queue");
    let crash_dir = cli.output_dir.join("crashes");
    let hang_dir = cli.output_dir.join("hangs");

    if checkpoint.is_none() {
        for seed in &seeds {
            backend.enable(command, seed)?;
            if backend.is_new_path() {
                save_finding(&queue_dir, seed)?;
            }
        }
    }

    let max_iterations = config.fuzzer.max_iterations;
    println!(
        "Starting fuzz loop for {} iterations with {} seeds against {:?}...",
        max_iterations,
        seeds.len(),
        command
    );
    let start_time = Instant::now();
    let mut buf = vec![0u8; config.fuzzer.max_input_len.max(1)];
    let mut executions = 0u64;
    let mut crashes = 0u64;
    let mut hangs = 0u64;
    let mut new_paths = 0u64;
    let mut queue = seeds;
    let mut cursor = 0;

    for i in 0..max_iterations {
        let budget = mutator.total_iterations().unwrap_or(VARIANTS_PER_INPUT);
        if mutator.current_iteration() >= budget && queue.len() > 1 {
            cursor = (cursor + 1) % queue.len();
            mutator.set_input(&queue[cursor]);
        }
        let len = match mutator.mutate(&mut buf) {
            Ok(len) => len,
            Err(MutatorError::Exhausted) => {
                info!("mutator exhausted after {} variants", mutator.current_iteration());
                break;
            }
            Err(e) => return Err(e.into()),
        };
        let input = &buf[..len];

        if let Err(e) = backend.enable(command, input) {
            warn!("run {i} failed: {e}");
            continue;
        }
        executions += 1;

        match backend.fuzz_result() {
            Some(FuzzResult::Crash) => {
                crashes += 1;
                let path = save_finding(&crash_dir, input)?;
                println!("\nCrash (execution {executions}) saved to {path:?}");
            }
            Some(FuzzResult::Hang) => {
                hangs += 1;
                save_finding(&hang_dir, input)?;
            }
            _ => {}
        }
        if backend.is_new_path() {
            new_paths += 1;
            save_finding(&queue_dir, input)?;
            queue.push(input.to_vec());
        }

        if let Some(path) = &config.fuzzer.checkpoint_path {
            if (i + 1) % config.fuzzer.checkpoint_interval.max(1) == 0 {
                save_checkpoint(path, backend.as_ref(), mutator.as_ref())?;
            }
        }

        if i > 0 && i % (max_iterations / 100).max(1) == 0 {
            let elapsed = start_time.elapsed().as_secs_f32();
            let exec_per_sec = if elapsed > 0.0 {
                executions as f32 / elapsed
            } else {
                0.0
            };
            print!(
                "\rIter: {}/{}, New paths: {}, Crashes: {}, Hangs: {}, Execs/sec: {:.2}   ",
                i, max_iterations, new_paths, crashes, hangs, exec_per_sec
            );
            use std::io::Write;
            std::io::stdout().flush()?;
        }
    }

    if let Some(path) = &config.fuzzer.checkpoint_path {
        save_checkpoint(path, backend.as_ref(), mutator.as_ref())?;
    }
    backend.cleanup();

    let elapsed_total = start_time.elapsed();
    println!("\nFuzz loop finished in {elapsed_total:.2?}.");
    println!(
        "Total Executions: {}, New Paths: {}, Crashes: {}, Hangs: {}",
        executions, new_paths, crashes, hangs
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("ember").chain(args.iter().copied()))
    }

    #[test]
    fn command_line_overrides_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ember.toml");
        fs::write(&path, "[target]\ncommand = \"./a @@\"\n[fuzzer]\nmax-iterations = 5\n").unwrap();

        let config = load_config(&cli(&[
            "--config-file",
            path.to_str().unwrap(),
            "--target-command",
            "./b",
            "-i",
            "9",
        ]))
        .unwrap();
        assert_eq!(config.target.command, "./b");
        assert_eq!(config.fuzzer.max_iterations, 9);
    }

    #[test]
    fn seeds_come_from_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("one"), b"1").unwrap();
        fs::write(dir.path().join("two"), b"22").unwrap();
        let mut seeds = load_seeds(&[dir.path().to_path_buf()]).unwrap();
        seeds.sort();
        assert_eq!(seeds, vec![b"1".to_vec(), b"22".to_vec()]);

        assert_eq!(load_seeds(&[]).unwrap(), vec![b"INIT".to_vec()]);
    }

    #[test]
    fn findings_are_named_by_digest() {
        let dir = tempfile::tempdir().unwrap();
        let first = save_finding(dir.path(), b"crash me").unwrap();
        let again = save_finding(dir.path(), b"crash me").unwrap();
        assert_eq!(first, again);
        assert_eq!(
            first.file_name().unwrap().to_str().unwrap(),
            format!("{:x}", md5::compute(b"crash me"))
        );
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
