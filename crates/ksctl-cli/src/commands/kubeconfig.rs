//! `ksctl kubeconfig` - print the admin kubeconfig of a bootstrapped cluster

use std::path::{Path, PathBuf};

use clap::Args;
use tokio::io::AsyncWriteExt;
use tracing::info;

use ksctl_common::store::LocalStore;
use ksctl_common::{StateStore, StorageDocument};

use crate::{Error, Result};

/// Print the stored kubeconfig
#[derive(Args, Debug)]
pub struct KubeconfigArgs {
    /// Path of the JSON state file
    #[arg(long, env = "KSCTL_STATE")]
    pub state: PathBuf,

    /// Output file path (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

fn stored_kubeconfig(doc: &StorageDocument) -> Result<&str> {
    doc.cluster_kubeconfig.as_deref().ok_or_else(|| {
        Error::validation(format!(
            "cluster {} has no kubeconfig yet, bootstrap it first",
            doc.cluster_name
        ))
    })
}

/// Owner-only from creation on; an existing file is narrowed before the
/// credentials land in it
async fn write_kubeconfig(path: &Path, kubeconfig: &str) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
    }
    file.write_all(kubeconfig.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Run the kubeconfig command
pub async fn run(args: KubeconfigArgs) -> Result<()> {
    let doc = LocalStore::new(&args.state).read().await?;
    let kubeconfig = stored_kubeconfig(&doc)?;

    match &args.output {
        Some(path) => {
            write_kubeconfig(path, kubeconfig).await?;
            info!(
                path = %path.display(),
                context = doc.cluster_kubeconfig_context.as_deref().unwrap_or_default(),
                "kubeconfig written"
            );
        }
        None => print!("{kubeconfig}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksctl_common::state::ClusterType;
    use std::sync::Arc;

    fn doc() -> StorageDocument {
        StorageDocument::new("aws", "fra1", "demo", ClusterType::SelfManaged)
    }

    #[test]
    fn missing_kubeconfig_names_the_cluster() {
        let err = stored_kubeconfig(&doc()).unwrap_err();
        assert!(err.to_string().contains("cluster demo has no kubeconfig"));
    }

    #[tokio::test]
    async fn kubeconfig_is_written_to_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        let out = dir.path().join("kubeconfig");

        let mut d = doc();
        d.cluster_kubeconfig = Some("apiVersion: v1\n".into());
        let store = Arc::new(LocalStore::new(&state));
        store.write(&d).await.unwrap();

        run(KubeconfigArgs {
            state,
            output: Some(out.clone()),
        })
        .await
        .unwrap();

        assert_eq!(std::fs::read_to_string(out).unwrap(), "apiVersion: v1\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kubeconfig_file_is_owner_only_even_when_it_existed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("kubeconfig");
        std::fs::write(&out, "old contents that are longer").unwrap();
        std::fs::set_permissions(&out, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_kubeconfig(&out, "apiVersion: v1\n").await.unwrap();

        let mode = std::fs::metadata(&out).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "apiVersion: v1\n");

        let fresh = dir.path().join("fresh");
        write_kubeconfig(&fresh, "x").await.unwrap();
        let mode = std::fs::metadata(&fresh).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
