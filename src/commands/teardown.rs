//! Teardown command: remove every managed kernel object.

use anyhow::Result;
use std::path::Path;

use crate::error::PbrError;
use crate::lock::LockGuard;

pub async fn run(config_path: &Path) -> Result<()> {
    super::require_root()?;
    let config = super::load_config(config_path)?;
    let _lock = LockGuard::acquire(&config.read().await.general.lock_file)?;
    let service = super::build_service(config, false).await?;

    match service.teardown_all().await {
        Ok(()) => {
            println!("All policies torn down.");
            Ok(())
        }
        Err(PbrError::Teardown(errors)) => {
            for e in &errors {
                eprintln!("[FAIL] {}", e);
            }
            anyhow::bail!("Teardown finished with {} error(s)", errors.len())
        }
        Err(e) => Err(e.into()),
    }
}
