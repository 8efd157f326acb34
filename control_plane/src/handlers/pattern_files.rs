use super::files::{ManagedFiles, entries};
use super::{Handler, HandlerError};
use crate::annotations::Settings;
use crate::store::K8s;
use async_trait::async_trait;
use haproxy_ingress_dataplane::HAProxy;
use std::collections::BTreeMap;

/// Writes each entry of the pattern files config map to the patterns
/// directory, where annotations reference them with `patterns/<name>`.
#[derive(Debug)]
pub struct PatternFiles {
    files: ManagedFiles,
}

impl PatternFiles {
    pub fn new(haproxy: &HAProxy) -> Self {
        Self {
            files: ManagedFiles::new("pattern file", &haproxy.env().patterns_dir),
        }
    }
}

#[async_trait]
impl Handler for PatternFiles {
    fn name(&self) -> &'static str {
        "pattern files"
    }

    async fn update(
        &mut self,
        store: &mut K8s,
        haproxy: &mut HAProxy,
        _settings: &Settings,
    ) -> Result<(), HandlerError> {
        let cm = &store.config_maps.pattern_files;
        let empty = BTreeMap::new();
        let data = if cm.loaded { &cm.annotations } else { &empty };
        if self.files.sync(entries(data)) {
            haproxy.instance_mut().reload("modified pattern files");
        }
        Ok(())
    }
}
