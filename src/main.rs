// Fixture generator binary
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use disk_fixtures::{default_matrix, CompressorKind, FixtureMatrixDriver, GeneratorConfig, RunError};
use log::{error, info};

/// Generate the disk-image test fixtures.
#[derive(Debug, Parser)]
#[command(name = "disk-fixtures", version, about)]
struct Cli {
    /// Root directory; one subdirectory is created per image family
    #[arg(long, env = "DISK_FIXTURES_OUTPUT_DIR", default_value = disk_fixtures::config::DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Raw-to-container converter executable
    #[arg(long, env = "DISK_FIXTURES_CONVERTER", default_value = "qemu-img")]
    converter: String,

    /// Gzip implementation used for compressed families
    #[arg(long, value_enum, default_value_t = CompressorKind::Builtin)]
    compressor: CompressorKind,

    /// Gzip executable for `--compressor external`
    #[arg(long = "gzip", env = "DISK_FIXTURES_GZIP", default_value = "gzip")]
    gzip_program: String,

    /// Gzip compression level (0 stores uncompressed, builtin compressor only)
    #[arg(long, default_value_t = 9, value_parser = clap::value_parser!(u32).range(0..=9))]
    level: u32,

    /// Kill any external tool running longer than this many seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Fixtures to generate concurrently (0 = one per CPU)
    #[arg(long, default_value_t = 1)]
    jobs: usize,

    /// Directory for scratch raw images
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Write a JSON manifest of the produced artifacts
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Print the planned artifacts and exit
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn into_config(self) -> Result<(GeneratorConfig, Option<PathBuf>, bool), String> {
        let timeout = self.timeout.map(parse_timeout).transpose()?;
        if self.compressor == CompressorKind::External && self.level == 0 {
            return Err("--level 0 is only supported by the builtin compressor".to_string());
        }

        let config = GeneratorConfig {
            output_root: self.output_dir,
            converter: self.converter,
            compressor: self.compressor,
            gzip_program: self.gzip_program,
            compression_level: self.level,
            timeout,
            jobs: self.jobs,
            scratch_dir: self.scratch_dir,
        };
        Ok((config, self.manifest, self.dry_run))
    }
}

fn parse_timeout(secs: f64) -> Result<Duration, String> {
    match Duration::try_from_secs_f64(secs) {
        Ok(limit) if !limit.is_zero() => Ok(limit),
        _ => Err(format!("--timeout must be a positive number of seconds, got {}", secs)),
    }
}

fn main() -> ExitCode {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let (config, manifest, dry_run) = match Cli::parse().into_config() {
        Ok(parsed) => parsed,
        Err(message) => {
            error!("{}", message);
            return ExitCode::FAILURE;
        }
    };

    let matrix = default_matrix();
    let driver = FixtureMatrixDriver::new(config);

    if dry_run {
        for planned in driver.plan(&matrix) {
            println!("{}/{}: {}", planned.family, planned.fixture, planned.command.join(" "));
            for artifact in &planned.artifacts {
                println!("    {}", artifact.path.display());
            }
        }
        return ExitCode::SUCCESS;
    }

    info!("Disk fixture generator starting...");
    match driver.run(&matrix) {
        Ok(summary) => {
            if let Some(path) = manifest {
                if let Err(e) = summary.write_manifest(&path) {
                    error!("Failed to write manifest {:?}: {}", path, e);
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(RunError::Environment(missing)) => {
            error!("{}", missing);
            error!("Install the missing tools or point the generator at them, then rerun");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("Fixture generation failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(args: &[&str]) -> Result<GeneratorConfig, String> {
        let cli = Cli::try_parse_from(std::iter::once("disk-fixtures").chain(args.iter().copied()))
            .map_err(|e| e.to_string())?;
        cli.into_config().map(|(config, _, _)| config)
    }

    #[test]
    fn test_timeout_is_parsed() {
        let config = config_from(&["--timeout", "1.5"]).unwrap();
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_unrepresentable_timeouts_are_rejected() {
        for bad in ["1e20", "0", "-3", "NaN", "inf"] {
            let err = config_from(&[&format!("--timeout={}", bad)]).unwrap_err();
            assert!(err.contains("--timeout must be"), "{}: {}", bad, err);
        }
    }

    #[test]
    fn test_level_zero_needs_builtin_compressor() {
        assert_eq!(config_from(&["--level", "0"]).unwrap().compression_level, 0);

        let err = config_from(&["--compressor", "external", "--level", "0"]).unwrap_err();
        assert!(err.contains("builtin"), "{}", err);

        let config = config_from(&["--compressor", "external", "--level", "1"]).unwrap();
        assert_eq!(config.build_compressor().required_tool(), Some("gzip"));
    }
}
