//! Resolves a `user`/`group` pair by name and drops into it, group first.
//! Used by `tainlog` (`--user`/`--group`) and `limiter` (`--user`/`--group`,
//! the mechanism a service's `run` script uses to drop its own privileges
//! before `execvp`-ing the real program). `monitor`/`scanner` also call this,
//! right after their startup chdir, but with no names — matching the
//! original's `ngim_priv_drop(NGIM_PRIV_SRVCTL, NULL, NULL)`, which without a
//! uid/gid name only trims capabilities and otherwise stays root. Here that
//! call is a no-op (there's nothing to trim without a name), but it's still
//! made so the startup sequence's shape matches across deployments that do
//! start root.

use anyhow::{Context, Result};
use nix::unistd::{setgid, setuid, Gid, Uid};

pub fn drop_privileges(user: Option<&str>, group: Option<&str>) -> Result<()> {
    if let Some(name) = group {
        let g = users::get_group_by_name(name)
            .with_context(|| format!("unknown group {name:?}"))?;
        setgid(Gid::from_raw(g.gid())).with_context(|| format!("setgid({name:?})"))?;
    }
    if let Some(name) = user {
        let u = users::get_user_by_name(name)
            .with_context(|| format!("unknown user {name:?}"))?;
        if group.is_none() {
            setgid(Gid::from_raw(u.primary_group_id()))
                .with_context(|| format!("setgid(primary group of {name:?})"))?;
        }
        setuid(Uid::from_raw(u.uid())).with_context(|| format!("setuid({name:?})"))?;
    }
    Ok(())
}
