// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thin-provisioning decorator.
//!
//! Thin pools place every volume inside a named pool object, so all volume
//! references handed to the underlying driver are qualified with the pool
//! name. The wrapped driver provides the mechanics; this layer contributes
//! only the thin-provisioning deltas (name qualification and snapshot
//! support).

use crate::backend::Provisioning;
use crate::backend::StorageError;
use crate::backend::VolumeBackend;
use async_trait::async_trait;
use camino::Utf8PathBuf;

pub struct ThinProvisioned<B> {
    inner: B,
    pool: String,
}

impl<B: VolumeBackend> ThinProvisioned<B> {
    pub fn new<S: Into<String>>(inner: B, pool: S) -> Self {
        Self { inner, pool: pool.into() }
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}/{}", self.pool, name)
    }
}

#[async_trait]
impl<B: VolumeBackend> VolumeBackend for ThinProvisioned<B> {
    fn provisioning(&self) -> Provisioning {
        Provisioning::Thin
    }

    async fn create(
        &self,
        name: &str,
        size_kib: u64,
        key: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        self.inner.create(&self.qualified(name), size_kib, key).await
    }

    async fn resize(
        &self,
        name: &str,
        size_kib: u64,
    ) -> Result<(), StorageError> {
        self.inner.resize(&self.qualified(name), size_kib).await
    }

    async fn delete(
        &self,
        name: &str,
        encrypted: bool,
    ) -> Result<(), StorageError> {
        self.inner.delete(&self.qualified(name), encrypted).await
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.exists(&self.qualified(name)).await
    }

    fn path(
        &self,
        name: &str,
        encrypted: bool,
    ) -> Result<Utf8PathBuf, StorageError> {
        self.inner.path(&self.qualified(name), encrypted)
    }

    async fn create_snapshot(
        &self,
        name: &str,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        self.inner.create_snapshot(&self.qualified(name), snapshot).await
    }

    async fn delete_snapshot(
        &self,
        name: &str,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        self.inner.delete_snapshot(&self.qualified(name), snapshot).await
    }

    async fn restore_snapshot(
        &self,
        src: &str,
        snapshot: &str,
        dst: &str,
        key: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        self.inner
            .restore_snapshot(
                &self.qualified(src),
                snapshot,
                &self.qualified(dst),
                key,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VolumeBackend for RecordingBackend {
        async fn create(
            &self,
            name: &str,
            _size_kib: u64,
            _key: Option<&[u8]>,
        ) -> Result<(), StorageError> {
            self.calls.lock().unwrap().push(format!("create {name}"));
            Ok(())
        }

        async fn resize(
            &self,
            name: &str,
            _size_kib: u64,
        ) -> Result<(), StorageError> {
            self.calls.lock().unwrap().push(format!("resize {name}"));
            Ok(())
        }

        async fn delete(
            &self,
            name: &str,
            _encrypted: bool,
        ) -> Result<(), StorageError> {
            self.calls.lock().unwrap().push(format!("delete {name}"));
            Ok(())
        }

        async fn exists(&self, _name: &str) -> Result<bool, StorageError> {
            Ok(false)
        }

        fn path(
            &self,
            name: &str,
            _encrypted: bool,
        ) -> Result<Utf8PathBuf, StorageError> {
            Ok(Utf8PathBuf::from(format!("/dev/{name}")))
        }

        async fn create_snapshot(
            &self,
            name: &str,
            snapshot: &str,
        ) -> Result<(), StorageError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("snapshot {name}@{snapshot}"));
            Ok(())
        }

        async fn delete_snapshot(
            &self,
            _name: &str,
            _snapshot: &str,
        ) -> Result<(), StorageError> {
            Ok(())
        }

        async fn restore_snapshot(
            &self,
            _src: &str,
            _snapshot: &str,
            _dst: &str,
            _key: Option<&[u8]>,
        ) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn qualifies_volume_names_with_the_pool() {
        let thin = ThinProvisioned::new(RecordingBackend::default(), "tp0");
        assert_eq!(thin.provisioning(), Provisioning::Thin);

        thin.create("r0_00000", 1024, None).await.unwrap();
        thin.create_snapshot("r0_00000", "s0").await.unwrap();
        assert_eq!(
            thin.path("r0_00000", false).unwrap(),
            Utf8PathBuf::from("/dev/tp0/r0_00000")
        );

        let calls = thin.inner.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "create tp0/r0_00000".to_string(),
                "snapshot tp0/r0_00000@s0".to_string(),
            ]
        );
    }
}
