//! Request authorization: SharedKeyLite signing or SAS query tokens.

use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ring::hmac;
use url::Url;

use tablekit_core::{ConfigError, ConnectionConfig, Credential};

/// RFC 1123 date, the only format the store accepts in `x-ms-date`.
pub(crate) fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub(crate) enum Signer {
    SharedKey { account: String, key: hmac::Key },
    Sas { token: String },
}

impl Signer {
    pub(crate) fn from_connection(connection: &ConnectionConfig) -> Result<Self, ConfigError> {
        match &connection.credential {
            Credential::SharedKey { account_key } => {
                let account = connection
                    .account_name
                    .clone()
                    .ok_or(ConfigError::MissingAccountName)?;
                let secret = general_purpose::STANDARD.decode(account_key).map_err(|e| {
                    ConfigError::InvalidAccountKey {
                        reason: e.to_string(),
                    }
                })?;
                Ok(Self::SharedKey {
                    account,
                    key: hmac::Key::new(hmac::HMAC_SHA256, &secret),
                })
            }
            Credential::SharedAccessSignature { token } => Ok(Self::Sas {
                token: token.clone(),
            }),
        }
    }

    /// Append the SAS token, if any. Call after every other query pair is set.
    pub(crate) fn authorize_url(&self, url: &mut Url) {
        if let Self::Sas { token } = self {
            let query = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{token}"),
                _ => token.clone(),
            };
            url.set_query(Some(&query));
        }
    }

    /// `Authorization` header value for a request to `url` sent at `date`.
    pub(crate) fn authorization(&self, date: &str, url: &Url) -> Option<String> {
        match self {
            Self::SharedKey { account, key } => {
                let to_sign = string_to_sign(date, account, url);
                let signature = hmac::sign(key, to_sign.as_bytes());
                Some(format!(
                    "SharedKeyLite {account}:{}",
                    general_purpose::STANDARD.encode(signature.as_ref())
                ))
            }
            Self::Sas { .. } => None,
        }
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedKey { account, .. } => f
                .debug_struct("SharedKey")
                .field("account", account)
                .finish_non_exhaustive(),
            Self::Sas { .. } => f.write_str("Sas"),
        }
    }
}

/// SharedKeyLite for tables: date, newline, then `/account` + the encoded path.
///
/// `comp` is the only query parameter that takes part in the resource.
fn string_to_sign(date: &str, account: &str, url: &Url) -> String {
    let mut resource = format!("/{account}{}", url.path());
    if let Some((_, comp)) = url.query_pairs().find(|(name, _)| name == "comp") {
        resource.push_str("?comp=");
        resource.push_str(&comp);
    }
    format!("{date}\n{resource}")
}
