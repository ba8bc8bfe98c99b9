use std::path::PathBuf;

use anyhow::Context;
use clap::ArgMatches;
use protinfer_core::infer::InferenceSettings;
use serde::{Deserialize, Serialize};

/// Actual run parameters - may include overrides or default values not set
/// by the user.
#[derive(Serialize)]
pub struct Search {
    #[serde(flatten)]
    pub settings: InferenceSettings,
    pub identifications: String,

    #[serde(skip_serializing)]
    pub output_directory: PathBuf,
}

/// Input parameters deserialized from a JSON file. Every section is
/// optional; the engine defaults apply to anything left out.
#[derive(Deserialize)]
pub struct Input {
    #[serde(flatten)]
    settings: InferenceSettings,
    identifications: Option<String>,
    output_directory: Option<String>,
}

impl Input {
    pub fn from_arguments(matches: ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .expect("required parameters");
        let mut input = Input::load(path)
            .with_context(|| format!("failed to read parameters from `{path}`"))?;

        // Handle JSON configuration overrides
        if let Some(identifications) = matches.get_one::<String>("identifications") {
            input.identifications = Some(identifications.into());
        }
        if let Some(output_directory) = matches.get_one::<String>("output_directory") {
            input.output_directory = Some(output_directory.into());
        }

        Ok(input)
    }

    pub fn load<S: AsRef<str>>(path: S) -> anyhow::Result<Self> {
        protinfer_core::read_json(path).map_err(anyhow::Error::from)
    }

    pub fn build(self) -> anyhow::Result<Search> {
        self.settings
            .validate()
            .context("invalid inference parameters")?;

        let lbp = &self.settings.loopy_belief_propagation;
        if lbp.dampening_lambda > 0.5 {
            log::warn!(
                "loopy_belief_propagation:dampening_lambda = {} barely moves messages; \
                 convergence will be slow",
                lbp.dampening_lambda
            );
        }
        if self.settings.top_psms == 0 {
            log::info!("top_psms = 0: considering every PSM of every spectrum");
        }

        let identifications = self
            .identifications
            .context("`identifications` must be provided (JSON field or command line)")?;

        let output_directory = match self.output_directory {
            Some(path) => {
                let path = PathBuf::from(path);
                std::fs::create_dir_all(&path)?;
                path
            }
            None => std::env::current_dir()?,
        };

        Ok(Search {
            settings: self.settings,
            identifications,
            output_directory,
        })
    }
}
