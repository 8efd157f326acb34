//! PEM files generated from TLS secrets.
//!
//! Each certificate kind has its own directory. Content changes are pushed
//! through the runtime socket first; a failed runtime update falls back to a
//! reload. Files are always rewritten on disk so a later reload picks them up.

use crate::instance::Instance;
use crate::runtime::{RuntimeClient, RuntimeError};
use haproxy_ingress_core::io::atomic_write;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate missing in {0}")]
    MissingCertificate(String),
    #[error("certificate or private key missing in {0}")]
    MissingKeyPair(String),
    #[error("unable to write certificate {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretType {
    FrontendDefault,
    Frontend,
    Backend,
    Ca,
    Tcp,
}

/// Borrowed view of a TLS secret.
#[derive(Debug, Clone, Copy)]
pub struct SecretRef<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub data: &'a BTreeMap<String, Vec<u8>>,
    /// False when the secret is unchanged since the last pass.
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct CertDirs {
    pub frontend: PathBuf,
    pub backend: PathBuf,
    pub ca: PathBuf,
    pub tcp: PathBuf,
}

#[derive(Debug)]
struct Cert {
    name: String,
    path: PathBuf,
    in_use: bool,
    created: bool,
}

#[derive(Debug)]
pub struct Certificates {
    dirs: CertDirs,
    frontend: BTreeMap<String, Cert>,
    backend: BTreeMap<String, Cert>,
    ca: BTreeMap<String, Cert>,
    tcp: BTreeMap<String, Cert>,
}

fn pem_content(key: &[u8], crt: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(key.len() + crt.len() + 1);
    content.extend_from_slice(key);
    if key.last().is_some_and(|last| *last != b'\n') {
        content.push(b'\n');
    }
    content.extend_from_slice(crt);
    content
}

impl Certificates {
    pub fn new(dirs: CertDirs) -> Self {
        Self {
            dirs,
            frontend: BTreeMap::new(),
            backend: BTreeMap::new(),
            ca: BTreeMap::new(),
            tcp: BTreeMap::new(),
        }
    }

    pub fn dirs(&self) -> &CertDirs {
        &self.dirs
    }

    /// Creates or updates the PEM file of a secret and returns its path.
    pub async fn add_secret(
        &mut self,
        secret: SecretRef<'_>,
        secret_type: SecretType,
        runtime: &RuntimeClient,
        instance: &mut Instance,
    ) -> Result<PathBuf, CertificateError> {
        let cert_name = match secret_type {
            SecretType::FrontendDefault => format!("0_{}_{}", secret.namespace, secret.name),
            _ => format!("{}_{}", secret.namespace, secret.name),
        };
        let (dir, certs) = match secret_type {
            SecretType::FrontendDefault | SecretType::Frontend => {
                (&self.dirs.frontend, &mut self.frontend)
            }
            SecretType::Backend => (&self.dirs.backend, &mut self.backend),
            SecretType::Ca => (&self.dirs.ca, &mut self.ca),
            SecretType::Tcp => (&self.dirs.tcp, &mut self.tcp),
        };
        let is_ca = secret_type == SecretType::Ca;

        if let Some(cert) = certs.get_mut(&cert_name) {
            cert.in_use = true;
            if !secret.changed {
                return Ok(cert.path.clone());
            }
        }

        let display_name = format!("{}/{}", secret.namespace, secret.name);
        let base = dir.join(&cert_name);
        let mut files = Vec::new();
        if is_ca {
            let crt = secret
                .data
                .get("tls.crt")
                .ok_or_else(|| CertificateError::MissingCertificate(display_name.clone()))?;
            files.push((with_extension(&base, ".pem"), pem_content(b"", crt)));
        } else {
            for kind in ["tls", "rsa", "ecdsa", "dsa"] {
                let key = secret.data.get(&format!("{kind}.key"));
                let crt = secret.data.get(&format!("{kind}.crt"));
                if let (Some(key), Some(crt)) = (key, crt) {
                    let path = if kind == "tls" {
                        with_extension(&base, ".pem")
                    } else {
                        with_extension(&base, &format!(".pem.{kind}"))
                    };
                    files.push((path, pem_content(key, crt)));
                }
            }
            if files.is_empty() {
                return Err(CertificateError::MissingKeyPair(display_name));
            }
        }

        let mut created = false;
        let mut path = base;
        for (file, content) in files {
            created |= write_cert(&file, &content, is_ca, runtime, instance).await?;
            path = file;
        }

        let cert = certs.entry(cert_name).or_insert_with(|| Cert {
            name: display_name,
            path: path.clone(),
            in_use: true,
            created: false,
        });
        cert.path.clone_from(&path);
        cert.in_use = true;
        cert.created |= created;
        Ok(path)
    }

    /// True when a frontend certificate is referenced in this pass.
    pub fn front_certs_in_use(&self) -> bool {
        self.frontend.values().any(|cert| cert.in_use)
    }

    /// True when a certificate file appeared in this pass.
    pub fn certs_created(&self) -> bool {
        [&self.frontend, &self.backend, &self.ca, &self.tcp]
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|cert| cert.created)
            .inspect(|cert| debug!("Secret '{}' was added", cert.name))
            .count()
            > 0
    }

    /// Resets per-pass usage flags.
    pub fn clean(&mut self) {
        for cert in [
            &mut self.frontend,
            &mut self.backend,
            &mut self.ca,
            &mut self.tcp,
        ]
        .into_iter()
        .flat_map(BTreeMap::values_mut)
        {
            cert.in_use = false;
            cert.created = false;
        }
    }

    /// Deletes certificate files that were not used in this pass.
    pub async fn refresh(&mut self, runtime: &RuntimeClient, instance: &mut Instance) {
        let dirs = self.dirs.clone();
        refresh_dir(&mut self.frontend, &dirs.frontend, runtime, instance).await;
        refresh_dir(&mut self.backend, &dirs.backend, runtime, instance).await;
        refresh_dir(&mut self.ca, &dirs.ca, runtime, instance).await;
        refresh_dir(&mut self.tcp, &dirs.tcp, runtime, instance).await;
    }
}

fn with_extension(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Writes one PEM file. Returns true when the file did not exist before.
async fn write_cert(
    path: &Path,
    content: &[u8],
    ca: bool,
    runtime: &RuntimeClient,
    instance: &mut Instance,
) -> Result<bool, CertificateError> {
    let existed = path.exists();
    let write = |path: &Path| {
        atomic_write(path, content).map_err(|source| CertificateError::Write {
            path: path.to_path_buf(),
            source,
        })
    };
    if !existed {
        write(path)?;
        debug!("cert written on disk[{}]", path.display());
    }

    let file = path.to_string_lossy();
    match update_runtime(&file, content, ca, runtime).await {
        Ok(()) => debug!("Runtime update of cert ok [{file}]"),
        Err(err) => instance.reload(format!(
            "Runtime update of cert file '{file}' failed : {err}"
        )),
    }

    if existed {
        write(path)?;
    }
    Ok(!existed)
}

async fn update_runtime(
    file: &str,
    content: &[u8],
    ca: bool,
    runtime: &RuntimeClient,
) -> Result<(), RuntimeError> {
    let already_exists = match runtime.new_cert(file, ca).await {
        Ok(()) => false,
        Err(RuntimeError::CertificateExists(_)) => true,
        Err(err) => return Err(err),
    };
    let payload = String::from_utf8_lossy(content);
    runtime.set_cert(file, &payload, ca).await?;
    if let Err(err) = runtime.commit_cert(file, ca).await {
        if let Err(abort) = runtime.abort_cert(file, ca).await {
            error!("{abort}");
        }
        return Err(err);
    }
    if !already_exists && !ca {
        let dir = Path::new(file)
            .parent()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();
        runtime.add_crt_list_entry(&dir, file).await?;
    }
    Ok(())
}

async fn refresh_dir(
    certs: &mut BTreeMap<String, Cert>,
    dir: &Path,
    runtime: &RuntimeClient,
    instance: &mut Instance,
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            error!("unable to read certificate directory {}: {err}", dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(cert_name) = file_name.strip_suffix(".pem") else {
            continue;
        };
        if certs.get(cert_name).is_some_and(|cert| cert.in_use) {
            continue;
        }
        let path = entry.path();
        let file = path.to_string_lossy();
        let crt_list = dir.to_string_lossy();
        let deleted = match runtime.delete_crt_list_entry(&crt_list, &file).await {
            Ok(()) => runtime.delete_cert(&file).await,
            Err(err) => Err(err),
        };
        match deleted {
            Ok(()) => debug!("Runtime delete of cert ok [{file_name}]"),
            Err(err) => instance.reload(format!(
                "Runtime delete of cert file '{file_name}' failed : {err}"
            )),
        }
        if let Err(err) = std::fs::remove_file(&path) {
            error!("unable to remove certificate {}: {err}", path.display());
        }
        certs.remove(cert_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, Runtime};
    use assertables::{assert_err, assert_ok};
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    fn dirs(root: &TempDir) -> CertDirs {
        let dirs = CertDirs {
            frontend: root.path().join("frontend"),
            backend: root.path().join("backend"),
            ca: root.path().join("ca"),
            tcp: root.path().join("tcp"),
        };
        for dir in [&dirs.frontend, &dirs.backend, &dirs.ca, &dirs.tcp] {
            assert_ok!(std::fs::create_dir_all(dir));
        }
        dirs
    }

    fn runtime(reply: &'static str) -> RuntimeClient {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_execute()
            .returning(move |_| Ok(reply.to_string()));
        RuntimeClient::new(Arc::new(runtime) as Arc<dyn Runtime>)
    }

    fn tls_data() -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            ("tls.key".to_string(), b"KEY".to_vec()),
            ("tls.crt".to_string(), b"CRT\n".to_vec()),
        ])
    }

    #[tokio::test]
    async fn test_default_frontend_cert_is_prefixed() {
        let root = assert_ok!(tempdir());
        let mut certs = Certificates::new(dirs(&root));
        let data = tls_data();
        let secret = SecretRef {
            namespace: "default",
            name: "tls",
            data: &data,
            changed: true,
        };
        let mut instance = Instance::default();

        let path = assert_ok!(
            certs
                .add_secret(secret, SecretType::FrontendDefault, &runtime(""), &mut instance)
                .await
        );

        assert_eq!(path, root.path().join("frontend").join("0_default_tls.pem"));
        assert_eq!(assert_ok!(std::fs::read(&path)), b"KEY\nCRT\n");
        assert!(certs.front_certs_in_use());
        assert!(certs.certs_created());
        assert!(!instance.need_reload());
    }

    #[tokio::test]
    async fn test_ca_requires_certificate() {
        let root = assert_ok!(tempdir());
        let mut certs = Certificates::new(dirs(&root));
        let data = BTreeMap::new();
        let secret = SecretRef {
            namespace: "default",
            name: "ca",
            data: &data,
            changed: true,
        };
        let mut instance = Instance::default();

        let err = assert_err!(
            certs
                .add_secret(secret, SecretType::Ca, &runtime(""), &mut instance)
                .await
        );
        assert!(matches!(err, CertificateError::MissingCertificate(_)));
    }

    #[tokio::test]
    async fn test_runtime_failure_requests_reload() {
        let root = assert_ok!(tempdir());
        let mut certs = Certificates::new(dirs(&root));
        let data = tls_data();
        let secret = SecretRef {
            namespace: "default",
            name: "tls",
            data: &data,
            changed: true,
        };
        let mut instance = Instance::default();

        assert_ok!(
            certs
                .add_secret(secret, SecretType::Backend, &runtime("Unknown command\n"), &mut instance)
                .await
        );
        assert!(instance.need_reload());
    }

    #[tokio::test]
    async fn test_refresh_removes_unused_certs() {
        let root = assert_ok!(tempdir());
        let mut certs = Certificates::new(dirs(&root));
        let data = tls_data();
        let secret = SecretRef {
            namespace: "default",
            name: "tls",
            data: &data,
            changed: true,
        };
        let mut instance = Instance::default();
        let client = runtime("");
        let path = assert_ok!(
            certs
                .add_secret(secret, SecretType::Frontend, &client, &mut instance)
                .await
        );

        certs.refresh(&client, &mut instance).await;
        assert!(path.exists());

        certs.clean();
        assert!(!certs.front_certs_in_use());
        certs.refresh(&client, &mut instance).await;
        assert!(!path.exists());
    }
}
