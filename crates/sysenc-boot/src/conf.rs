//! EFI boot configuration block: `Key=Value` lines, UTF-8, optional BOM.

use sysenc_core::{Prf, SysencError, SysencResult};

const BOM: &[u8] = b"\xEF\xBB\xBF";

pub const KEY_PASSWORD_TYPE: &str = "PasswordType";
pub const KEY_PASSWORD_MSG: &str = "PasswordMsg";
pub const KEY_PASSWORD_PICTURE: &str = "PasswordPicture";
pub const KEY_HASH_MSG: &str = "HashMsg";
pub const KEY_HASH: &str = "Hash";
pub const KEY_HASH_RQT: &str = "HashRqt";
pub const KEY_PIM_MSG: &str = "PimMsg";
pub const KEY_PIM: &str = "Pim";
pub const KEY_PIM_RQT: &str = "PimRqt";
pub const KEY_AUTHORIZE_VISIBLE: &str = "AuthorizeVisible";
pub const KEY_AUTHORIZE_RETRY: &str = "AuthorizeRetry";
pub const KEY_BML_LOCK_FLAGS: &str = "DcsBmlLockFlags";
pub const KEY_BML_DRIVER: &str = "DcsBmlDriver";
pub const KEY_ACTION_SUCCESS: &str = "ActionSuccess";

/// What the installer knows about the volume and the user's choices.
#[derive(Debug, Clone)]
pub struct BootSettings {
    pub password_prompt: String,
    /// `None` makes the loader ask for the PRF
    pub prf: Option<Prf>,
    /// 0 = default iterations; non-zero makes the loader ask for the PIM
    pub pim: u32,
    /// Loader to chain into after a successful unlock, relative to the ESP root
    pub chain_loader: Option<String>,
}

/// Ordered key/value pairs. Unknown keys survive updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootConfig {
    entries: Vec<(String, String)>,
    bom: bool,
}

impl BootConfig {
    pub fn parse(bytes: &[u8]) -> SysencResult<Self> {
        let (bom, body) = match bytes.strip_prefix(BOM) {
            Some(rest) => (true, rest),
            None => (false, bytes),
        };
        let text = std::str::from_utf8(body)
            .map_err(|e| SysencError::Config(format!("boot configuration is not UTF-8: {e}")))?;

        let mut entries: Vec<(String, String)> = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(SysencError::Config(format!(
                    "boot configuration line {}: expected Key=Value",
                    n + 1
                )));
            };
            let key = key.trim();
            match entries.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.trim().to_string(),
                None => entries.push((key.to_string(), value.trim().to_string())),
            }
        }
        Ok(Self { entries, bom })
    }

    /// A fresh block for `settings`, written with a BOM.
    pub fn from_settings(settings: &BootSettings) -> Self {
        let mut config = Self {
            entries: Vec::new(),
            bom: true,
        };
        config.apply(settings, false);
        config
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.bom {
            out.extend_from_slice(BOM);
        }
        for (key, value) in &self.entries {
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    fn set_default(&mut self, key: &str, value: impl Into<String>, keep_existing: bool) {
        if keep_existing && self.get(key).is_some() {
            return;
        }
        self.set(key, value);
    }

    /// Bring the block in line with `settings`.
    ///
    /// Volume-bound keys (hash, PIM, chain loader, driver flags) are always
    /// rewritten. Prompt and appearance keys keep their current values when
    /// `preserve_user_config` is set.
    pub fn apply(&mut self, settings: &BootSettings, preserve_user_config: bool) {
        let keep = preserve_user_config;
        self.set_default(KEY_PASSWORD_TYPE, "0", keep);
        self.set_default(KEY_PASSWORD_MSG, settings.password_prompt.clone(), keep);
        self.set_default(KEY_PASSWORD_PICTURE, "login.bmp", keep);
        self.set_default(
            KEY_HASH_MSG,
            "(0) TEST ALL (1) SHA512 (2) SHA256 (3) ARGON2ID\\nHash: ",
            keep,
        );
        self.set_default(KEY_PIM_MSG, "PIM (Leave empty for default): ", keep);
        self.set_default(KEY_AUTHORIZE_VISIBLE, "0", keep);
        self.set_default(KEY_AUTHORIZE_RETRY, "10", keep);

        match settings.prf {
            Some(prf) => {
                self.set(KEY_HASH, prf.id().to_string());
                self.set(KEY_HASH_RQT, "0");
            }
            None => {
                self.set(KEY_HASH, "0");
                self.set(KEY_HASH_RQT, "1");
            }
        }
        // A non-default PIM is never written to the ESP.
        if settings.pim == 0 {
            self.set(KEY_PIM, "0");
            self.set(KEY_PIM_RQT, "0");
        } else {
            self.remove(KEY_PIM);
            self.set(KEY_PIM_RQT, "1");
        }
        self.set(KEY_BML_LOCK_FLAGS, "0x80000000");
        self.set(KEY_BML_DRIVER, "1");
        match &settings.chain_loader {
            Some(path) => self.set(KEY_ACTION_SUCCESS, format!("postexec file({path})")),
            None => {
                self.remove(KEY_ACTION_SUCCESS);
            }
        }
    }

    /// PRF recorded in the block, if it is fixed.
    pub fn prf(&self) -> Option<Prf> {
        if self.get(KEY_HASH_RQT) == Some("1") {
            return None;
        }
        let id: u8 = self.get(KEY_HASH)?.parse().ok()?;
        Prf::from_id(id).ok()
    }

    pub fn pim_requested(&self) -> bool {
        self.get(KEY_PIM_RQT) == Some("1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(prf: Option<Prf>, pim: u32) -> BootSettings {
        BootSettings {
            password_prompt: "Enter password: ".into(),
            prf,
            pim,
            chain_loader: Some("\\EFI\\sysenc\\original_loader.efi".into()),
        }
    }

    #[test]
    fn fresh_block_has_all_keys() {
        let config = BootConfig::from_settings(&settings(Some(Prf::Sha256), 0));
        for key in [
            KEY_PASSWORD_TYPE,
            KEY_PASSWORD_MSG,
            KEY_PASSWORD_PICTURE,
            KEY_HASH_MSG,
            KEY_HASH,
            KEY_HASH_RQT,
            KEY_PIM_MSG,
            KEY_PIM,
            KEY_PIM_RQT,
            KEY_AUTHORIZE_VISIBLE,
            KEY_AUTHORIZE_RETRY,
            KEY_BML_LOCK_FLAGS,
            KEY_BML_DRIVER,
            KEY_ACTION_SUCCESS,
        ] {
            assert!(config.get(key).is_some(), "missing {key}");
        }
        assert_eq!(config.prf(), Some(Prf::Sha256));
        assert!(config.to_bytes().starts_with(BOM));
        assert_eq!(
            config.get(KEY_ACTION_SUCCESS),
            Some("postexec file(\\EFI\\sysenc\\original_loader.efi)")
        );
    }

    #[test]
    fn parse_with_and_without_bom() {
        let with = BootConfig::parse(b"\xEF\xBB\xBFHash=1\r\nPimRqt = 1\n\n# note\n").unwrap();
        assert_eq!(with.get(KEY_HASH), Some("1"));
        assert!(with.pim_requested());
        assert!(with.to_bytes().starts_with(BOM));

        let without = BootConfig::parse(b"Hash=2\n").unwrap();
        assert_eq!(without.prf(), Some(Prf::Sha256));
        assert_eq!(without.to_bytes(), b"Hash=2\n");
    }

    #[test]
    fn malformed_input_rejected() {
        assert!(BootConfig::parse(b"\xFF\xFE").is_err());
        assert!(BootConfig::parse(b"NoEquals\n").is_err());
    }

    #[test]
    fn preserve_keeps_user_keys_and_unknowns() {
        let mut config =
            BootConfig::parse(b"PasswordMsg=Who goes there?\nCustomKey=42\nHash=1\n").unwrap();
        config.apply(&settings(Some(Prf::Argon2id), 0), true);
        assert_eq!(config.get(KEY_PASSWORD_MSG), Some("Who goes there?"));
        assert_eq!(config.get("CustomKey"), Some("42"));
        assert_eq!(config.prf(), Some(Prf::Argon2id));

        config.apply(&settings(Some(Prf::Argon2id), 0), false);
        assert_eq!(config.get(KEY_PASSWORD_MSG), Some("Enter password: "));
        assert_eq!(config.get("CustomKey"), Some("42"));
    }

    #[test]
    fn custom_pim_is_not_stored() {
        let mut config = BootConfig::from_settings(&settings(Some(Prf::Sha512), 0));
        assert_eq!(config.get(KEY_PIM), Some("0"));
        config.apply(&settings(None, 485), true);
        assert_eq!(config.get(KEY_PIM), None);
        assert!(config.pim_requested());
        assert_eq!(config.prf(), None);
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let config = BootConfig::parse(b"Hash=1\nHash=3\n").unwrap();
        assert_eq!(config.prf(), Some(Prf::Argon2id));
        assert_eq!(config.keys().count(), 1);
    }
}
