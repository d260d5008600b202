//! `ksctl keygen` - create the cluster SSH keypair
//!
//! The public half is printed so it can be handed to whatever provisions
//! the machines. Running it again prints the same key.

use clap::Args;

use ksctl_bootstrap::credentials::ensure_ssh_keypair;

use super::ClusterArgs;
use crate::Result;

/// Generate or show the cluster SSH keypair
#[derive(Args, Debug)]
pub struct KeygenArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
}

/// Run the keygen command
pub async fn run(args: KeygenArgs) -> Result<()> {
    let state = args.cluster.open().await?;
    let pair = ensure_ssh_keypair(&state).await?;
    println!("{}", pair.public_key);
    Ok(())
}
