//! Différences de l'API selon la version de la plateforme

use super::ApiError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// "6.4.2", "7.0.0rc1" (suffixe ignoré), "5.0"
    pub fn parse(text: &str) -> Result<Self, ApiError> {
        let mut parts = text.trim().splitn(3, '.').map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>()
        });
        let mut next = |required: bool| match parts.next() {
            Some(Ok(n)) => Ok(n),
            None if !required => Ok(0),
            _ => Err(ApiError::Decode(format!("invalid API version '{text}'"))),
        };
        Ok(Self { major: next(true)?, minor: next(true)?, patch: next(false)? })
    }

    fn at_least(self, major: u32, minor: u32) -> bool {
        self >= Self::new(major, minor, 0)
    }

    pub fn supports_templategroups(self) -> bool {
        self.at_least(6, 2)
    }

    /// Paramètre de host.get / maintenance.get pour inclure les groupes
    pub fn select_hostgroups_param(self) -> &'static str {
        if self.at_least(6, 2) { "selectHostGroups" } else { "selectGroups" }
    }

    pub fn login_user_field(self) -> &'static str {
        if self.at_least(5, 4) { "username" } else { "user" }
    }

    /// Jeton de session en en-tête `Authorization: Bearer` plutôt que dans le corps
    pub fn auth_in_header(self) -> bool {
        self.at_least(6, 4)
    }

    /// maintenance.update : `hosts: [{hostid}]` ou `hostids: [...]`
    pub fn maintenance_hosts_as_objects(self) -> bool {
        self.at_least(6, 0)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
