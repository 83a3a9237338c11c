use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match instrument_bridge_lib::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Instrument bridge failed");
            eprintln!("instrument-bridge: {e}");
            ExitCode::FAILURE
        }
    }
}
