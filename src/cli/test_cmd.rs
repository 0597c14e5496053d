use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};

use crate::core::checkin::CheckinAggregator;
use crate::core::history::HistoryStore;
use crate::core::lock::{self, Acquisition};
use crate::core::plan::PluginSpec;
use crate::core::runner::{Outcome, PluginRunner};
use crate::core::terminal::{print_error, print_info, print_warn};
use crate::platform::{NativePlatform, Platform};

use super::Settings;

/// Runs one plugin from a local file through the real engine pieces
/// (interval 0, no id) and prints the batch it would have shipped.
pub(crate) async fn run_test(settings: &Settings) -> Result<()> {
    let Some(path) = settings.rest.get(1) else {
        print_error("Usage: vigil test PATH_TO_PLUGIN [opt1=val1 opt2=val2 ...]");
        return Ok(());
    };
    let code = std::fs::read_to_string(path)?;

    let mut options = Map::new();
    for pair in &settings.rest[2..] {
        match pair.split_once('=') {
            Some((name, value)) => {
                options.insert(name.to_string(), Value::String(value.to_string()));
            }
            None => print_warn(&format!(
                "Option '{}' is no good; provided options should be in the format name=value.",
                pair
            )),
        }
    }
    if options.is_empty() {
        print_info("You haven't provided any options for running this plugin.");
    } else {
        let rendered: Vec<String> = options
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        print_info(&format!("Running plugin with: {}", rendered.join("; ")));
    }

    let spec = PluginSpec {
        id: None,
        name: "Local Plugin".to_string(),
        code,
        options,
        interval: 0,
        timeout: None,
        path: Some(path.clone()),
    };

    let lock_dir = settings
        .history
        .parent()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(|| NativePlatform::data_dir());
    let _lock = match lock::acquire(&lock_dir)? {
        Acquisition::Held(pid) => {
            print_error(&format!("Process {} was already running; exiting.", pid));
            return Ok(());
        }
        Acquisition::Acquired(lock) => lock,
    };

    let mut history = HistoryStore::load(&settings.history)?;
    let key = spec.key();
    let mut record = history.record(&key, spec.legacy_key());

    let mut aggregator = CheckinAggregator::default();
    match PluginRunner::run(&spec, &record).await {
        Outcome::Skipped => {}
        Outcome::Completed(data) => {
            aggregator.absorb(spec.id, &data);
            record.last_run = Some(Utc::now());
            if let Some(memory) = data.memory {
                record.memory = Some(memory);
            }
            history.commit(&key, spec.legacy_key(), record);
            history.save()?;
        }
        Outcome::Failed(err) => {
            let (subject, body) = err.to_entry();
            aggregator.absorb_error(spec.id, &subject, body.as_deref());
        }
    }

    println!("{}", serde_json::to_string_pretty(&aggregator.finalize())?);
    Ok(())
}
