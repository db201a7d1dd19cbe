//! Local profile store: the keypairs a user can publish as, and which one is
//! active. Stored as plain JSON next to the env file.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Error, Result},
    keys::Keys,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub npub: String,
    pub nsec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Profile {
    pub fn keys(&self) -> Result<Keys> {
        Keys::from_nsec(&self.nsec)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: Vec<Profile>,
    #[serde(default)]
    active: Option<String>,
}

/// File-backed profile list keyed by `npub`.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a profile from its `nsec`. Re-adding an existing key updates its
    /// name. The first profile added becomes active.
    pub fn add(&self, nsec: &str, name: Option<String>) -> Result<Profile> {
        let keys = Keys::from_nsec(nsec)?;
        let profile = Profile {
            npub: keys.npub()?,
            nsec: keys.nsec()?,
            name,
        };
        let mut file = self.load()?;
        match file.profiles.iter_mut().find(|p| p.npub == profile.npub) {
            Some(existing) => existing.name = profile.name.clone(),
            None => file.profiles.push(profile.clone()),
        }
        if file.active.is_none() {
            file.active = Some(profile.npub.clone());
        }
        self.save(&file)?;
        info!(npub = %profile.npub, "profile added");
        Ok(profile)
    }

    /// Remove a profile; returns whether it existed.
    pub fn remove(&self, npub: &str) -> Result<bool> {
        let mut file = self.load()?;
        let before = file.profiles.len();
        file.profiles.retain(|p| p.npub != npub);
        if file.profiles.len() == before {
            return Ok(false);
        }
        if file.active.as_deref() == Some(npub) {
            file.active = None;
        }
        self.save(&file)?;
        info!(npub, "profile removed");
        Ok(true)
    }

    pub fn list(&self) -> Result<Vec<Profile>> {
        Ok(self.load()?.profiles)
    }

    pub fn set_active(&self, npub: &str) -> Result<()> {
        let mut file = self.load()?;
        if !file.profiles.iter().any(|p| p.npub == npub) {
            return Err(Error::UnknownProfile(npub.to_string()));
        }
        file.active = Some(npub.to_string());
        self.save(&file)
    }

    pub fn active(&self) -> Result<Option<Profile>> {
        let file = self.load()?;
        let Some(active) = file.active else {
            return Ok(None);
        };
        Ok(file.profiles.into_iter().find(|p| p.npub == active))
    }

    fn load(&self) -> Result<ProfileFile> {
        if !self.path.exists() {
            return Ok(ProfileFile::default());
        }
        let data = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Rewrite the file atomically.
    fn save(&self, file: &ProfileFile) -> Result<()> {
        let parent_dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent_dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
        serde_json::to_writer_pretty(&tmp, file)?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ProfileStore {
        ProfileStore::new(dir.path().join("profiles.json"))
    }

    #[test]
    fn first_profile_becomes_active() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.active().unwrap().is_none());
        let keys = Keys::generate();
        let profile = store.add(&keys.nsec().unwrap(), Some("alice".into())).unwrap();
        assert_eq!(profile.npub, keys.npub().unwrap());
        assert_eq!(store.active().unwrap(), Some(profile.clone()));

        let other = Keys::generate();
        store.add(&other.nsec().unwrap(), None).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.active().unwrap(), Some(profile));
    }

    #[test]
    fn readding_updates_name_without_duplicating() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let nsec = Keys::generate().nsec().unwrap();
        store.add(&nsec, None).unwrap();
        store.add(&nsec, Some("renamed".into())).unwrap();
        let all = store.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name.as_deref(), Some("renamed"));
    }

    #[test]
    fn set_active_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let a = store.add(&Keys::generate().nsec().unwrap(), None).unwrap();
        let b = store.add(&Keys::generate().nsec().unwrap(), None).unwrap();
        store.set_active(&b.npub).unwrap();
        assert_eq!(store.active().unwrap().unwrap().npub, b.npub);

        assert!(store.remove(&b.npub).unwrap());
        assert!(store.active().unwrap().is_none());
        assert!(!store.remove(&b.npub).unwrap());
        assert_eq!(store.list().unwrap(), vec![a]);
    }

    #[test]
    fn unknown_profile_cannot_be_activated() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let npub = Keys::generate().npub().unwrap();
        assert!(matches!(
            store.set_active(&npub),
            Err(Error::UnknownProfile(_))
        ));
    }

    #[test]
    fn invalid_nsec_is_rejected_and_nothing_written() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.add("nsec1bogus", None),
            Err(Error::InvalidKeyMaterial(_))
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn stored_profile_restores_keys() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let keys = Keys::generate();
        store.add(&keys.nsec().unwrap(), None).unwrap();
        let restored = store.active().unwrap().unwrap().keys().unwrap();
        assert_eq!(restored.public_key_hex(), keys.public_key_hex());
    }
}
