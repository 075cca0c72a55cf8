use anyhow::Result;
use sortie_proto::setpoint::{RC_MAX, RC_MIN};

use crate::flight::ThrottleRamp;
use crate::{LinkConfig, Timing};

pub fn check_link(link: &LinkConfig) -> Result<()> {
    check_endpoint(&link.endpoint)?;
    if let Some(candidates) = &link.candidate_endpoints {
        anyhow::ensure!(!candidates.is_empty(), "fc.link.candidate_endpoints is empty");
        for c in candidates {
            check_endpoint(c)?;
        }
    }
    anyhow::ensure!(link.sys_id != 0, "fc.link.sys_id 0 is the broadcast id");
    anyhow::ensure!(link.probe_timeout_ms >= 500, "fc.link.probe_timeout_ms too short; set >= 500");
    Ok(())
}

pub fn check_endpoint(endpoint: &str) -> Result<()> {
    let (scheme, rest) = endpoint
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("endpoint {:?} has no scheme", endpoint))?;
    match scheme {
        "udpin" | "udpout" | "udpbcast" | "tcpin" | "tcpout" => {
            anyhow::ensure!(rest.rsplit_once(':').is_some(), "endpoint {:?} needs host:port", endpoint);
        }
        "serial" => {
            let (dev, baud) = rest
                .rsplit_once(':')
                .ok_or_else(|| anyhow::anyhow!("serial endpoint {:?} needs dev:baud", endpoint))?;
            anyhow::ensure!(!dev.is_empty(), "serial endpoint {:?} has no device", endpoint);
            anyhow::ensure!(baud.parse::<u32>().is_ok(), "serial endpoint {:?} has bad baud rate", endpoint);
        }
        other => anyhow::bail!("unknown endpoint scheme {:?} in {:?}", other, endpoint),
    }
    Ok(())
}

pub fn check_timing(t: &Timing) -> Result<()> {
    anyhow::ensure!(t.heartbeat_interval_ms >= 100 && t.heartbeat_interval_ms <= 5000, "fc.timing.heartbeat_interval_ms should be 100..5000");
    anyhow::ensure!(t.ack_timeout_ms >= 100, "fc.timing.ack_timeout_ms too short");
    anyhow::ensure!(t.max_command_retries <= 10, "fc.timing.max_command_retries above 10");
    anyhow::ensure!(t.setpoint_rate_hz >= 2 && t.setpoint_rate_hz <= 50, "fc.timing.setpoint_rate_hz should be 2..50");
    anyhow::ensure!(
        t.link_loss_ms > t.heartbeat_interval_ms * 2,
        "fc.timing.link_loss_ms must exceed two heartbeat intervals"
    );
    anyhow::ensure!(t.first_heartbeat_timeout_ms >= t.heartbeat_interval_ms, "fc.timing.first_heartbeat_timeout_ms shorter than one heartbeat");
    Ok(())
}

pub fn check_ramp(name: &str, ramp: &ThrottleRamp) -> Result<()> {
    check_pwm(name, ramp.from)?;
    check_pwm(name, ramp.to)?;
    anyhow::ensure!(ramp.step > 0, "{}.step must be > 0", name);
    anyhow::ensure!(ramp.step_ms >= 50, "{}.step_ms too short", name);
    Ok(())
}

pub fn check_pwm(name: &str, pwm: u16) -> Result<()> {
    anyhow::ensure!((RC_MIN..=RC_MAX).contains(&pwm), "{} pwm {} outside {}..{}", name, pwm, RC_MIN, RC_MAX);
    Ok(())
}
