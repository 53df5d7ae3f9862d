//! Command-line surface.
//!
//! `tagrip download [options...] tags...`. Options come first; the first
//! token that is not a known option starts the tag list, which lets negative
//! tags keep their leading dash.

use std::path::PathBuf;

use crate::engine::io::{
    ConfigError, DownloadMode, FetchTuning, RunConfig, Settings, epoch_date, parse_date, today,
};

const DEFAULT_MODULE: &str = "gelbooru";

pub(crate) const USAGE: &str = "\
Usage: tagrip download [options...] tags...

Options:
  -module NAME         site module to scan (default gelbooru)
  -threads N           worker threads, 1..=32
  -path DIR            destination directory
  -mindate DD-MM-YYYY  skip items older than this date
  -maxdate DD-MM-YYYY  skip items newer than this date
  -proxy URL           route all requests through this proxy
  -timeout SECONDS     per-request timeout, 2..=600
  -retries N           fetch retry budget, 1..=1000
  -dlimit N            keep only the N most recent items
  -dmode MODE          full, skip or touch (default full)
  -get_maxid           report the newest item id and exit
  -skip_images         do not download still images
  -skip_videos         do not download videos
  -split               expand every OR-group into separate scans
  -help                print this text

The first token that is not an option starts the tag list, so negative tags
keep their leading dash: tagrip download cat -dog";

#[derive(Debug)]
pub(crate) enum Command {
    Run(RunConfig),
    Help,
}

/// Parses the argument list against the persisted defaults.
pub(crate) fn parse<I>(args: I, settings: &Settings) -> Result<Command, ConfigError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    match args.next().as_deref() {
        Some("download") => {}
        Some("help") | Some("-help") | Some("--help") => return Ok(Command::Help),
        Some(other) => {
            return Err(ConfigError::InvalidOption {
                option: "command",
                reason: format!("unknown command {other:?}; expected download"),
            });
        }
        None => return Ok(Command::Help),
    }

    let mut config = RunConfig {
        module: String::from(DEFAULT_MODULE),
        query: Vec::new(),
        dest: PathBuf::from(&settings.download_directory),
        threads: settings.threads,
        min_date: epoch_date(),
        max_date: today(),
        download_limit: None,
        mode: DownloadMode::Full,
        skip_images: false,
        skip_videos: false,
        split_groups: false,
        get_maxid: false,
        max_query_len: settings.max_query_len,
        max_query_tokens: settings.max_query_tokens,
        fetch: FetchTuning::from_settings(settings, None),
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-module" => config.module = required(&mut args, "-module")?,
            "-threads" => config.threads = number(&mut args, "-threads")?,
            "-path" => config.dest = PathBuf::from(required(&mut args, "-path")?),
            "-mindate" => {
                config.min_date = parse_date("-mindate", &required(&mut args, "-mindate")?)?;
            }
            "-maxdate" => {
                config.max_date = parse_date("-maxdate", &required(&mut args, "-maxdate")?)?;
            }
            "-proxy" => config.fetch.proxy = Some(required(&mut args, "-proxy")?),
            "-timeout" => config.fetch.timeout_secs = number(&mut args, "-timeout")?,
            "-retries" => config.fetch.retries = number(&mut args, "-retries")?,
            "-dlimit" => {
                let limit: usize = number(&mut args, "-dlimit")?;
                if limit == 0 {
                    return Err(ConfigError::InvalidOption {
                        option: "-dlimit",
                        reason: String::from("a limit of 0 keeps nothing"),
                    });
                }
                config.download_limit = Some(limit);
            }
            "-dmode" => {
                let value = required(&mut args, "-dmode")?;
                config.mode =
                    DownloadMode::parse(&value).ok_or_else(|| ConfigError::InvalidOption {
                        option: "-dmode",
                        reason: format!("{value:?} is not full, skip or touch"),
                    })?;
            }
            "-get_maxid" => config.get_maxid = true,
            "-skip_images" => config.skip_images = true,
            "-skip_videos" => config.skip_videos = true,
            "-split" => config.split_groups = true,
            "-help" | "--help" => return Ok(Command::Help),
            _ => {
                config.query.push(arg);
                config.query.extend(args);
                break;
            }
        }
    }

    if config.query.is_empty() && !config.get_maxid {
        return Err(ConfigError::InvalidOption {
            option: "tags",
            reason: String::from("no tags given; try -help"),
        });
    }
    config.validate()?;
    Ok(Command::Run(config))
}

fn required(
    args: &mut impl Iterator<Item = String>,
    option: &'static str,
) -> Result<String, ConfigError> {
    args.next().ok_or_else(|| ConfigError::InvalidOption {
        option,
        reason: String::from("missing value"),
    })
}

fn number<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    option: &'static str,
) -> Result<T, ConfigError> {
    let value = required(args, option)?;
    value.parse().map_err(|_| ConfigError::InvalidOption {
        option,
        reason: format!("{value:?} is not a number"),
    })
}
