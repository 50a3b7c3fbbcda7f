use std::fmt;

use anyhow::{Result, bail};
use tracing::debug;

use crate::topology::NetContext;

/// Named degradation profile for one link.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ImpairmentProfile {
    #[default]
    None,
    Delay {
        delay_ms: u32,
    },
    Loss {
        loss_percent: f32,
    },
    LossDelayJitter {
        loss_percent: f32,
        delay_ms: u32,
        jitter_ms: u32,
    },
}

impl ImpairmentProfile {
    pub fn config(&self) -> ImpairmentConfig {
        match *self {
            ImpairmentProfile::None => ImpairmentConfig::default(),
            ImpairmentProfile::Delay { delay_ms } => ImpairmentConfig {
                delay_ms: Some(delay_ms),
                ..Default::default()
            },
            ImpairmentProfile::Loss { loss_percent } => ImpairmentConfig {
                loss_percent: Some(loss_percent),
                ..Default::default()
            },
            ImpairmentProfile::LossDelayJitter {
                loss_percent,
                delay_ms,
                jitter_ms,
            } => ImpairmentConfig {
                delay_ms: Some(delay_ms),
                jitter_ms: Some(jitter_ms),
                loss_percent: Some(loss_percent),
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for ImpairmentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImpairmentProfile::None => write!(f, "none"),
            ImpairmentProfile::Delay { delay_ms } => write!(f, "delay {delay_ms}ms"),
            ImpairmentProfile::Loss { loss_percent } => write!(f, "loss {loss_percent}%"),
            ImpairmentProfile::LossDelayJitter {
                loss_percent,
                delay_ms,
                jitter_ms,
            } => write!(f, "loss {loss_percent}% delay {delay_ms}ms ±{jitter_ms}ms"),
        }
    }
}

/// Raw `tc netem` parameters.
///
/// All fields default to `None`. Set only the parameters you need; omitted
/// parameters are not passed to `tc`. An all-`None` config clears any
/// existing impairment on the interface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImpairmentConfig {
    pub delay_ms: Option<u32>,
    pub jitter_ms: Option<u32>,
    pub loss_percent: Option<f32>,
}

impl ImpairmentConfig {
    /// True if no impairment parameters are set (config would be a no-op).
    pub fn is_empty(&self) -> bool {
        self.delay_ms.is_none() && self.loss_percent.is_none()
    }

    /// Build the netem parameter list.
    pub fn netem_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(delay) = self.delay_ms {
            args.push("delay".into());
            args.push(format!("{delay}ms"));
            if let Some(jitter) = self.jitter_ms
                && jitter > 0
            {
                args.push(format!("{jitter}ms"));
            }
        }

        if let Some(loss) = self.loss_percent {
            args.push("loss".into());
            args.push(format!("{loss}%"));
        }

        args
    }

    /// Reject values netem would refuse.
    pub fn validate(&self) -> Result<()> {
        if let Some(loss) = self.loss_percent
            && !(0.0..=100.0).contains(&loss)
        {
            bail!("loss {loss}% outside 0..=100");
        }
        if self.jitter_ms.is_some() && self.delay_ms.is_none() {
            bail!("jitter requires a base delay");
        }
        Ok(())
    }
}

/// Apply impairment to `interface` inside `ctx`.
///
/// Replaces whatever root qdisc is installed; profiles never stack.
pub fn apply_impairment(ctx: &dyn NetContext, interface: &str, config: &ImpairmentConfig) -> Result<()> {
    config.validate()?;

    // Always start clean
    clear_impairment(ctx, interface);

    if config.is_empty() {
        return Ok(());
    }

    let netem_params = config.netem_args();
    let mut args = vec!["qdisc", "add", "dev", interface, "root", "netem"];
    args.extend(netem_params.iter().map(String::as_str));
    tc_checked(ctx, &args, "apply netem qdisc")?;

    debug!(ctx = ctx.label(), interface, params = %netem_params.join(" "), "impairment applied");
    Ok(())
}

/// Remove the root qdisc from `interface`; missing qdiscs are ignored.
pub fn clear_impairment(ctx: &dyn NetContext, interface: &str) {
    let _ = ctx.exec("tc", &["qdisc", "del", "dev", interface, "root"]);
}

/// Run `tc` inside `ctx`, bailing with stderr + the full command on failure.
fn tc_checked(ctx: &dyn NetContext, args: &[&str], what: &str) -> Result<()> {
    let output = ctx.exec("tc", args)?;
    if !output.status.success() {
        bail!(
            "{what}: tc {}\n{}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
