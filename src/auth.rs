use std::time::{Duration, SystemTime, SystemTimeError, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::conf::ConfJwt;

pub type JwtResult<T> = jsonwebtoken::errors::Result<T>;

#[derive(
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    clap::ValueEnum,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub role: Role,
    aud: String,
    iss: String,
    exp: u64,
}

impl Claims {
    pub fn new(
        sub: &str,
        role: Role,
        ttl: Duration,
        jwt_conf: &ConfJwt,
    ) -> Result<Self, SystemTimeError> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        let exp = now.saturating_add(ttl).as_secs();
        Ok(Self {
            sub: sub.to_string(),
            role,
            aud: jwt_conf.audience.clone(),
            iss: jwt_conf.issuer.clone(),
            exp,
        })
    }

    pub fn to_str(&self, jwt_conf: &ConfJwt) -> JwtResult<String> {
        let key = EncodingKey::from_secret(jwt_conf.secret.as_bytes());
        jsonwebtoken::encode(&Header::default(), self, &key)
    }

    /// HS256 only. `exp`, `sub`, `aud` and `iss` must all be present and
    /// valid.
    pub fn from_str(str: &str, jwt_conf: &ConfJwt) -> JwtResult<Self> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0; // "exp" should mean what it says.
        validation.set_required_spec_claims(&["exp", "sub", "aud", "iss"]);
        validation.set_audience(&[&jwt_conf.audience]);
        validation.set_issuer(&[&jwt_conf.issuer]);
        let key = DecodingKey::from_secret(jwt_conf.secret.as_bytes());
        let data = jsonwebtoken::decode::<Self>(str, &key, &validation)?;
        Ok(data.claims)
    }
}

/// Restrictions carried by a request authenticated with an API key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyScope {
    pub key_id: String,
    /// Empty means every tool.
    pub allowed_tools: Vec<String>,
}

impl KeyScope {
    #[must_use]
    pub fn allows(&self, tool_id: &str) -> bool {
        self.allowed_tools.is_empty()
            || self.allowed_tools.iter().any(|t| t == tool_id)
    }
}

/// The authenticated party behind a request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub uid: String,
    pub role: Role,
    pub key: Option<KeyScope>,
}

impl Caller {
    #[must_use]
    pub fn user(uid: &str, role: Role) -> Self {
        Self {
            uid: uid.to_string(),
            role,
            key: None,
        }
    }

    #[must_use]
    pub fn key_id(&self) -> Option<&str> {
        self.key.as_ref().map(|k| k.key_id.as_str())
    }

    #[must_use]
    pub fn may_use(&self, tool_id: &str) -> bool {
        self.key.as_ref().map_or(true, |k| k.allows(tool_id))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jsonwebtoken::errors::ErrorKind;

    use crate::conf::ConfJwt;

    use super::{Caller, Claims, KeyScope, Role};

    #[test]
    fn good() {
        let conf = ConfJwt::default();
        let claims =
            Claims::new("foo", Role::Admin, Duration::from_secs(5), &conf)
                .unwrap();
        let encoded: String = claims.to_str(&conf).unwrap();
        let decoded = Claims::from_str(&encoded, &conf).unwrap();
        assert_eq!(&claims, &decoded);
        assert_eq!(decoded.role, Role::Admin);
    }

    #[test]
    fn bad_key() {
        let conf_good = ConfJwt::default();
        let conf_bad = ConfJwt {
            secret: conf_good.secret.to_string() + "naughty",
            ..conf_good.clone()
        };
        let claims =
            Claims::new("foo", Role::User, Duration::from_secs(5), &conf_good)
                .unwrap();

        let encoded: String = claims.to_str(&conf_good).unwrap();
        let decode_result = Claims::from_str(&encoded, &conf_bad);

        assert!(matches!(
            decode_result,
            Err(e) if e.kind().eq(&ErrorKind::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_audience() {
        let conf_good = ConfJwt::default();
        let conf_other = ConfJwt {
            audience: "someone-else".to_string(),
            ..conf_good.clone()
        };
        let claims =
            Claims::new("foo", Role::User, Duration::from_secs(5), &conf_good)
                .unwrap();
        let encoded: String = claims.to_str(&conf_good).unwrap();
        let decode_result = Claims::from_str(&encoded, &conf_other);

        assert!(matches!(
            decode_result,
            Err(e) if e.kind().eq(&ErrorKind::InvalidAudience)
        ));
    }

    #[test]
    fn expired() {
        let conf = ConfJwt {
            secret: "super secret".to_string(),
            ..Default::default()
        };

        let mut claims =
            Claims::new("foo", Role::User, Duration::ZERO, &conf).unwrap();
        claims.exp -= 10; // Expire arbitrarily-far back in the past.

        let encoded: String = claims.to_str(&conf).unwrap();
        let decode_result = Claims::from_str(&encoded, &conf);
        dbg!(&decode_result);

        assert!(matches!(
            decode_result,
            Err(e) if e.kind().eq(&ErrorKind::ExpiredSignature)
        ));
    }

    #[test]
    fn key_scope_allowlist() {
        let open = KeyScope {
            key_id: "k1".to_string(),
            allowed_tools: vec![],
        };
        assert!(open.allows("flux-schnell"));

        let narrow = KeyScope {
            key_id: "k2".to_string(),
            allowed_tools: vec!["text-to-speech".to_string()],
        };
        assert!(narrow.allows("text-to-speech"));
        assert!(!narrow.allows("flux-schnell"));

        let caller = Caller {
            uid: "u".to_string(),
            role: Role::User,
            key: Some(narrow),
        };
        assert!(!caller.may_use("flux-schnell"));
        assert!(Caller::user("u", Role::User).may_use("flux-schnell"));
    }
}
