use std::process::ExitCode;

fn install_rustls_provider() {
    use rustls::crypto::{ring, CryptoProvider};

    if CryptoProvider::get_default().is_none() {
        ring::default_provider().install_default().expect("install ring crypto provider");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    install_rustls_provider();

    match hydra::cli::run_cli().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "hydra failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
