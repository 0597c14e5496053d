use anyhow::Result;
use console::style;

use crate::core::terminal::{self, print_error, print_step, print_success};
use crate::core::transport::ServerClient;

use super::Settings;

/// Interactive first-run setup: take the server key, prove it works with a
/// live plan fetch, and hand the user a crontab line.
pub(crate) async fn run_install(settings: &Settings) -> Result<()> {
    if !console::user_attended() {
        print_error(
            "The install wizard needs an interactive terminal. Run 'vigil --help' for usage.",
        );
        return Ok(());
    }

    terminal::print_banner();
    println!(
        "  {}",
        style("You need the server key displayed in the Server Settings tab.").bold()
    );
    println!(
        "  It looks like: {}",
        style("6ecad322-0d17-4cb8-9b2c-a12c4541853f").dim()
    );
    println!();

    let key = inquire::Text::new("Server key:").prompt()?;
    let key = key.trim().to_string();

    print_step("Attempting to contact the server...");
    let client = ServerClient::new(&settings.server, &key)?;
    match client.fetch_plan(None).await {
        Ok(_) => {
            print_success("Success!");
            let program = std::env::current_exe()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "vigil".to_string());
            println!();
            println!("Now set vigil up to run on a scheduled basis.");
            println!();
            println!("If you are using this user's crontab (crontab -e to edit):");
            println!();
            println!("  {}", style(format!("* * * * * {} {}", program, key)).cyan());
            println!();
            println!("vigil decides for itself which checks are due on each run,");
            println!("so an every-minute cadence is safe.");
        }
        Err(e) => {
            print_error(&format!("{}", e));
            println!();
            println!("Failed. Check the key and the --server value, then try again.");
        }
    }
    Ok(())
}
