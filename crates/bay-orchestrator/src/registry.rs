use bay_domain::{Profile, ProfileId};

use crate::error::Error;

/// The configured profile set. Profiles are configuration — immutable for
/// the life of the process.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<Profile>,
}

impl ProfileRegistry {
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self { profiles }
    }

    pub fn get(&self, id: &ProfileId) -> Result<&Profile, Error> {
        self.profiles
            .iter()
            .find(|p| &p.id == id)
            .ok_or_else(|| Error::Validation(format!("unknown profile '{id}'")))
    }

    pub fn all(&self) -> &[Profile] {
        &self.profiles
    }
}
