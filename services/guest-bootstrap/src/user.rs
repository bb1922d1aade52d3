//! Resolution of `user[:group]` strings to numeric ids.

use nix::unistd::{getegid, geteuid, Gid, Group, Uid, User as PasswdEntry};
use vmbuild_plan::User;

/// Numeric identity a command runs as or a resource is owned by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: Uid,
    pub gid: Gid,
}

impl Identity {
    /// Identity of the running agent.
    pub fn current() -> Self {
        Self {
            uid: geteuid(),
            gid: getegid(),
        }
    }

    /// Resolve a `user[:group]` value against the guest's passwd and group
    /// databases. Numeric parts are used as-is. Without a group, the user's
    /// primary group is used, falling back to gid 0 for numeric users with
    /// no passwd entry.
    pub fn resolve(user: &User) -> Result<Self, String> {
        let (user_part, group_part) = user.parts();

        let (uid, primary_gid) = if user_part.is_empty() {
            (Uid::from_raw(0), Some(Gid::from_raw(0)))
        } else if let Ok(raw) = user_part.parse::<u32>() {
            let uid = Uid::from_raw(raw);
            let primary = PasswdEntry::from_uid(uid).ok().flatten().map(|entry| entry.gid);
            (uid, primary)
        } else {
            let entry = PasswdEntry::from_name(user_part)
                .map_err(|e| format!("failed to look up user '{}': {}", user_part, e))?
                .ok_or_else(|| format!("unknown user '{}'", user_part))?;
            (entry.uid, Some(entry.gid))
        };

        let gid = match group_part {
            Some(group) => match group.parse::<u32>() {
                Ok(raw) => Gid::from_raw(raw),
                Err(_) => {
                    Group::from_name(group)
                        .map_err(|e| format!("failed to look up group '{}': {}", group, e))?
                        .ok_or_else(|| format!("unknown group '{}'", group))?
                        .gid
                }
            },
            None => primary_gid.unwrap_or_else(|| Gid::from_raw(0)),
        };

        Ok(Self { uid, gid })
    }
}
