use nix::unistd::{Group, User};
use unitd_core::{IdentityRef, UnitdError};

/// Numeric identity a child is started with. `None` keeps the supervisor's own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

pub fn resolve_identity(
    user: Option<&IdentityRef>,
    group: Option<&IdentityRef>,
) -> Result<ResolvedIdentity, UnitdError> {
    Ok(ResolvedIdentity {
        uid: user.map(resolve_user).transpose()?,
        gid: group.map(resolve_group).transpose()?,
    })
}

pub fn resolve_user(user: &IdentityRef) -> Result<u32, UnitdError> {
    resolve(user, "user", |name| {
        User::from_name(name)
            .map(|found| found.map(|u| u.uid.as_raw()))
            .map_err(|e| e.to_string())
    })
}

pub fn resolve_group(group: &IdentityRef) -> Result<u32, UnitdError> {
    resolve(group, "group", |name| {
        Group::from_name(name)
            .map(|found| found.map(|g| g.gid.as_raw()))
            .map_err(|e| e.to_string())
    })
}

fn resolve<F>(reference: &IdentityRef, kind: &'static str, lookup: F) -> Result<u32, UnitdError>
where
    F: Fn(&str) -> Result<Option<u32>, String>,
{
    let failure = |value: String, reason: String| UnitdError::IdentityResolution {
        kind,
        value,
        reason,
    };

    let by_name = |name: &str| match lookup(name) {
        Ok(Some(id)) => Ok(id),
        Ok(None) => Err(failure(name.to_string(), format!("no such {kind}"))),
        Err(reason) => Err(failure(name.to_string(), reason)),
    };

    match reference {
        IdentityRef::Id(id) => Ok(*id),
        IdentityRef::Name(name) => by_name(name),
        IdentityRef::Env(var) => {
            let value = std::env::var(var)
                .map_err(|e| failure(reference.to_string(), e.to_string()))?;
            let value = value.trim();
            if value.is_empty() {
                return Err(failure(reference.to_string(), "variable is empty".to_string()));
            }
            match value.parse::<u32>() {
                Ok(id) => Ok(id),
                Err(_) => by_name(value),
            }
        }
    }
}
