//! Phone number canonicalisation.
//!
//! Canonical form is digits only with the Mexican country code `52` and no
//! `+`, e.g. `525512345678`. WhatsApp user addresses are `{phone}@s.whatsapp.net`.

use crate::error::{BridgeError, BridgeResult};

pub const COUNTRY_CODE: &str = "52";
pub const USER_JID_SUFFIX: &str = "@s.whatsapp.net";
pub const GROUP_JID_SUFFIX: &str = "@g.us";
pub const BROADCAST_JID_SUFFIX: &str = "@broadcast";

/// Normalize an arbitrary phone string to the canonical dialable identifier.
///
/// * 10 digits: local number, `52` is prepended
/// * 11 digits starting with `1`: the `1` is replaced by `52`
/// * 12 digits starting with `52`: already canonical
///
/// Any other shape is a [`BridgeError::Validation`].
pub fn normalize(input: &str) -> BridgeResult<String> {
    let digits: String = input.chars().filter(char::is_ascii_digit).collect();
    let digits = digits.trim_start_matches('0');

    match digits.len() {
        10 => Ok(format!("{COUNTRY_CODE}{digits}")),
        11 if digits.starts_with('1') => Ok(format!("{COUNTRY_CODE}{}", &digits[1..])),
        12 if digits.starts_with(COUNTRY_CODE) => Ok(digits.to_string()),
        _ => Err(BridgeError::Validation(input.to_string())),
    }
}

/// User part of a JID: `5215512345678:3@s.whatsapp.net` -> `5215512345678`.
pub fn jid_user(jid: &str) -> &str {
    let user = jid.split_once('@').map_or(jid, |(user, _)| user);
    user.split_once(':').map_or(user, |(user, _)| user)
}

pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with(GROUP_JID_SUFFIX)
}

pub fn is_broadcast_jid(jid: &str) -> bool {
    jid.ends_with(BROADCAST_JID_SUFFIX)
}

pub fn to_user_jid(phone: &str) -> String {
    format!("{phone}{USER_JID_SUFFIX}")
}

/// Phone used to associate an inbound JID with a lead.
///
/// Uses the canonical form when the user part normalizes. Mobile JIDs in the
/// `521` + 10 digit shape do not, and keep their raw digits.
pub fn lead_key(jid_user: &str) -> String {
    normalize(jid_user).unwrap_or_else(|_| {
        jid_user
            .chars()
            .filter(char::is_ascii_digit)
            .collect::<String>()
    })
}
