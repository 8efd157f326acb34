use super::files::{ManagedFiles, entries};
use super::{Handler, HandlerError};
use crate::annotations::Settings;
use crate::store::K8s;
use async_trait::async_trait;
use haproxy_ingress_dataplane::HAProxy;
use haproxy_ingress_dataplane::models::Errorfile;
use std::collections::BTreeMap;
use tracing::warn;

/// Status codes HAProxy accepts in an `errorfile` directive.
pub const ERROR_CODES: [u16; 15] = [
    200, 400, 401, 403, 404, 405, 407, 408, 410, 425, 429, 500, 502, 503, 504,
];

/// Turns the entries of the error files config map, keyed by status code,
/// into `errorfile` directives of the defaults section.
#[derive(Debug)]
pub struct ErrorFiles {
    files: ManagedFiles,
}

impl ErrorFiles {
    pub fn new(haproxy: &HAProxy) -> Self {
        Self {
            files: ManagedFiles::new("error file", &haproxy.env().errorfiles_dir),
        }
    }
}

fn valid_code(name: &str) -> Option<u16> {
    let code = name.parse::<u16>().ok()?;
    ERROR_CODES.contains(&code).then_some(code)
}

#[async_trait]
impl Handler for ErrorFiles {
    fn name(&self) -> &'static str {
        "errorfiles"
    }

    async fn update(
        &mut self,
        store: &mut K8s,
        haproxy: &mut HAProxy,
        _settings: &Settings,
    ) -> Result<(), HandlerError> {
        let cm = &store.config_maps.errorfiles;
        let empty = BTreeMap::new();
        let data = if cm.loaded { &cm.annotations } else { &empty };

        let valid = entries(data).filter(|(name, _)| {
            let ok = valid_code(name).is_some();
            if !ok {
                warn!("errorfile '{name}': unsupported HTTP status code");
            }
            ok
        });
        let changed = self.files.sync(valid);

        let errorfiles = self
            .files
            .names()
            .iter()
            .filter_map(|name| {
                Some(Errorfile {
                    code: valid_code(name)?,
                    file: self.files.path(name).display().to_string(),
                })
            })
            .collect::<Vec<_>>();
        let defaults = &mut haproxy.config_mut()?.defaults;
        if defaults.errorfiles != errorfiles {
            defaults.errorfiles = errorfiles;
            haproxy.instance_mut().reload("modified errorfiles");
        } else if changed {
            haproxy.instance_mut().reload("modified errorfiles");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::tests::annotations;
    use crate::testing::haproxy;
    use assertables::{assert_ok, assert_ok_eq_x};
    use rstest::rstest;
    use tempfile::tempdir;

    #[rstest]
    #[case("503", Some(503))]
    #[case("200", Some(200))]
    #[case("418", None)]
    #[case("five", None)]
    fn test_status_codes(#[case] name: &str, #[case] expected: Option<u16>) {
        assert_eq!(valid_code(name), expected);
    }

    #[tokio::test]
    async fn test_errorfiles_in_defaults() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let mut store = K8s::new(crate::store::StoreParams::default());
        let mut handler = ErrorFiles::new(&haproxy);
        let settings = Settings::default();

        store.config_maps.errorfiles.loaded = true;
        store.config_maps.errorfiles.annotations =
            annotations(&[("503", "HTTP/1.0 503 Busy\r\n\r\n"), ("999", "nope")]);
        assert_ok!(handler.update(&mut store, &mut haproxy, &settings).await);

        let config = assert_ok!(haproxy.config());
        assert_eq!(config.defaults.errorfiles.len(), 1);
        assert_eq!(config.defaults.errorfiles[0].code, 503);
        let path = haproxy.env().errorfiles_dir.join("503");
        assert_eq!(config.defaults.errorfiles[0].file, path.display().to_string());
        assert_ok_eq_x!(&std::fs::read_to_string(&path), "HTTP/1.0 503 Busy\r\n\r\n");
        assert!(haproxy.instance().need_reload());

        haproxy.instance_mut().reset();
        assert_ok!(handler.update(&mut store, &mut haproxy, &settings).await);
        assert!(!haproxy.instance().need_reload());

        store.config_maps.errorfiles.loaded = false;
        assert_ok!(handler.update(&mut store, &mut haproxy, &settings).await);
        assert!(assert_ok!(haproxy.config()).defaults.errorfiles.is_empty());
        assert!(!path.exists());
        assert!(haproxy.instance().need_reload());
    }
}
