use anyhow::Context;
use cpal::Device;
use cpal::traits::{DeviceTrait, HostTrait};

fn get_host() -> cpal::Host {
    cpal::default_host()
}

/// Finds the named input device, or the host default when no name is given.
pub fn get_or_default_input(device_name: Option<&str>) -> anyhow::Result<Device> {
    let host = get_host();
    tracing::debug!("host: {:?}", host.id());
    let Some(target) = device_name else {
        return host
            .default_input_device()
            .context("no default input device");
    };
    host.input_devices()
        .context("failed to enumerate input devices")?
        .find(|d| d.name().is_ok_and(|name| name == target))
        .with_context(|| format!("no input device named {target:?}"))
}

/// Finds the named output device, or the host default when no name is given.
pub fn get_or_default_output(device_name: Option<&str>) -> anyhow::Result<Device> {
    let host = get_host();
    let Some(target) = device_name else {
        return host
            .default_output_device()
            .context("no default output device");
    };
    host.output_devices()
        .context("failed to enumerate output devices")?
        .find(|d| d.name().is_ok_and(|name| name == target))
        .with_context(|| format!("no output device named {target:?}"))
}

fn describe(name: &str, channels: u16, sample_rate: u32, default_name: Option<&str>) -> String {
    let mut d = format!(" * {}({}ch, {}hz)", name, channels, sample_rate);
    if Some(name) == default_name {
        d.push_str(" [default]");
    }
    d
}

/// One line per input device with its default config.
pub fn get_available_inputs() -> anyhow::Result<String> {
    let host = get_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let mut device_names = Vec::new();
    for device in host.input_devices().context("no input devices found")? {
        let Ok(name) = device.name() else { continue };
        match device.default_input_config() {
            Ok(cfg) => device_names.push(describe(
                &name,
                cfg.channels(),
                cfg.sample_rate().0,
                default_name.as_deref(),
            )),
            Err(e) => tracing::debug!("skipping {}: {}", name, e),
        }
    }
    Ok(device_names.join("\n"))
}

/// One line per output device with its default config.
pub fn get_available_outputs() -> anyhow::Result<String> {
    let host = get_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    let mut device_names = Vec::new();
    for device in host.output_devices().context("no output devices found")? {
        let Ok(name) = device.name() else { continue };
        match device.default_output_config() {
            Ok(cfg) => device_names.push(describe(
                &name,
                cfg.channels(),
                cfg.sample_rate().0,
                default_name.as_deref(),
            )),
            Err(e) => tracing::debug!("skipping {}: {}", name, e),
        }
    }
    Ok(device_names.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_marks_default() {
        assert_eq!(
            describe("mic", 1, 16000, Some("mic")),
            " * mic(1ch, 16000hz) [default]"
        );
        assert_eq!(describe("usb", 2, 48000, Some("mic")), " * usb(2ch, 48000hz)");
    }
}
