//! Command-line interface handling for the tile builder.
//!
//! Flags override values from the configuration file.

use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use network_tiles::SpatialCentroid;
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Graph JSON file to tile
    pub input: PathBuf,
    /// Optional override for the output directory
    pub output_dir: Option<PathBuf>,
    /// Name of the tile set; defaults to the input file stem
    pub asset_id: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    pub workers: Option<usize>,
    pub all_cores: bool,
    pub seed: Option<u64>,
    /// Region to query once the tiles are written
    pub query: Option<SpatialCentroid>,
    pub budget: Option<usize>,
}

fn command() -> Command {
    Command::new("Tile Builder")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tiles a graph into a quadtree of content files for zoomable viewers")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("tile_builder.toml"),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("FILE")
                .help("Graph JSON file to tile")
                .required(true),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("DIR")
                .help("Output directory"),
        )
        .arg(
            Arg::new("asset")
                .short('a')
                .long("asset")
                .value_name("ID")
                .help("Tile set name (defaults to the input file name)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("N")
                .help("Insertion worker count")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("all-cores")
                .long("all-cores")
                .help("Run one insertion worker per CPU core")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_name("N")
                .help("Seed for reproducible sparse samples")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("query")
                .short('q')
                .long("query")
                .value_name("X,Y,HW,HH")
                .allow_hyphen_values(true)
                .help("Region to query after tiling (center and half-widths)"),
        )
        .arg(
            Arg::new("budget")
                .long("budget")
                .value_name("N")
                .help("Maximum tiles returned by the sparse query")
                .value_parser(clap::value_parser!(usize)),
        )
}

impl CliArgs {
    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Result<Self> {
        Self::from_matches(&command().get_matches())
    }

    pub fn try_parse_from<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString> + Clone,
    {
        let matches = command().try_get_matches_from(args)?;
        Self::from_matches(&matches)
    }

    fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let query = matches
            .get_one::<String>("query")
            .map(|raw| parse_region(raw))
            .transpose()?;

        Ok(Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_default(),
            input: matches
                .get_one::<String>("input")
                .map(PathBuf::from)
                .unwrap_or_default(),
            output_dir: matches.get_one::<String>("output").map(PathBuf::from),
            asset_id: matches.get_one::<String>("asset").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            workers: matches.get_one::<usize>("workers").copied(),
            all_cores: matches.get_flag("all-cores"),
            seed: matches.get_one::<u64>("seed").copied(),
            query,
            budget: matches.get_one::<usize>("budget").copied(),
        })
    }

    /// Asset id for the tile set: `--asset`, else the input file stem.
    pub fn asset_id(&self) -> String {
        self.asset_id.clone().unwrap_or_else(|| {
            self.input
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "graph".to_string())
        })
    }
}

/// Parses `x,y,half_width,half_height`.
pub fn parse_region(raw: &str) -> Result<SpatialCentroid> {
    let values = raw
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .with_context(|| format!("Invalid number '{}' in region '{}'", part.trim(), raw))
        })
        .collect::<Result<Vec<f64>>>()?;

    let &[x, y, hw, hh] = values.as_slice() else {
        bail!("Region '{}' must have four values: x,y,half_width,half_height", raw);
    };
    if hw < 0.0 || hh < 0.0 {
        bail!("Region '{}' has a negative half-width", raw);
    }
    Ok(SpatialCentroid::new(x, y, hw, hh))
}
