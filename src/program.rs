use std::env;
use std::path::Path;

use anyhow::Error;
use console::Term;

use crate::cli::{self, Command};
use crate::engine::WebConnector;
use crate::engine::io::{SETTINGS_NAME, Settings};
use crate::engine::sender::RequestSender;
use crate::sites;

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Drives one invocation from the argument list to the finished run.
pub(crate) struct Program;

impl Program {
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) fn run(&self) -> Result<(), Error> {
        Term::stdout().set_title(format!("{NAME} {VERSION}"));
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);

        trace!("Loading settings...");
        let settings = Settings::load_or_create(Path::new(SETTINGS_NAME))?;

        let config = match cli::parse(env::args().skip(1), &settings)? {
            Command::Help => {
                println!("{}", cli::USAGE);
                return Ok(());
            }
            Command::Run(config) => config,
        };

        let adapter = sites::adapter_for(&config.module).ok_or_else(|| {
            anyhow::anyhow!(
                "unknown module {:?}; known modules: {}",
                config.module,
                sites::KNOWN_MODULES.join(", ")
            )
        })?;
        trace!("Module {} selected...", adapter.name());

        let sender = RequestSender::new(config.fetch.clone())?;
        let connector = WebConnector::new(adapter, sender, config);
        connector.run()?;

        info!("Finished!");
        Ok(())
    }
}
