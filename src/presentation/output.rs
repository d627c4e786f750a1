use crate::domain::packet::{DeviceType, MeterReport, Packet};
use serde::Serialize;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Text
        }
    }
}

#[derive(Serialize)]
struct FailedOutput {
    r#type: &'static str,
    frame: String,
}

pub fn format_packet(packet: &Packet, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string(packet).unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Text => match packet {
            Packet::Report(report) => format_report(report),
            Packet::Reply(reply) => format!(
                "reply   status={:#04X} {}",
                reply.status,
                hex::encode_upper(&reply.payload)
            ),
            Packet::Command(echo) => format!(
                "command {:?} code={:#04X} arg={}",
                echo.device, echo.code, echo.argument
            ),
        },
    }
}

pub fn format_failure(frame: &[u8], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string(&FailedOutput {
            r#type: "failed",
            frame: hex::encode(frame),
        })
        .unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Text => format!("failed  {}", hex::encode_upper(frame)),
    }
}

fn format_report(r: &MeterReport) -> String {
    let secs = r.duration.as_secs();
    let mut line = format!(
        "{:<7} {:>7.2} V {:>7.3} A {:>8.2} W",
        device_label(r.device),
        r.voltage,
        r.current,
        r.power
    );
    if let Some(capacity) = r.capacity {
        line.push_str(&format!(" {:>6} mAh", capacity));
    }
    let energy_unit = if r.device == DeviceType::Usb { "Wh" } else { "kWh" };
    line.push_str(&format!(" {:>8.2} {}", r.energy, energy_unit));
    if let Some(freq) = r.frequency {
        line.push_str(&format!(" {:>5.1} Hz", freq));
    }
    if let Some(pf) = r.power_factor {
        line.push_str(&format!(" PF {:.3}", pf));
    }
    line.push_str(&format!(
        " {:>3} C {:02}:{:02}:{:02}",
        r.temperature,
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    ));
    line
}

fn device_label(device: DeviceType) -> &'static str {
    match device {
        DeviceType::Ac => "AC",
        DeviceType::Dc => "DC",
        DeviceType::Usb => "USB",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::packet::Reply;
    use std::time::Duration;

    fn usb_report() -> MeterReport {
        MeterReport {
            device: DeviceType::Usb,
            voltage: 5.1,
            current: 0.5,
            power: 2.55,
            capacity: Some(120),
            energy: 0.6,
            data_minus: Some(0.0),
            data_plus: Some(0.6),
            temperature: 31,
            duration: Duration::from_secs(3_725),
            ..MeterReport::default()
        }
    }

    #[test]
    fn text_report_line() {
        let line = format_packet(&Packet::Report(usb_report()), OutputFormat::Text);
        assert!(line.starts_with("USB"));
        assert!(line.contains("5.10 V"));
        assert!(line.contains("120 mAh"));
        assert!(line.contains("0.60 Wh"));
        assert!(line.ends_with("01:02:05"));
    }

    #[test]
    fn json_packet_is_tagged() {
        let json = format_packet(&Packet::Report(usb_report()), OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "report");
        assert_eq!(value["device"], "usb");
        assert_eq!(value["duration"], 3725);
    }

    #[test]
    fn failure_lines() {
        assert_eq!(
            format_failure(&[0xFF, 0x55, 0x01], OutputFormat::Text),
            "failed  FF5501"
        );
        assert_eq!(
            format_failure(&[0xAB], OutputFormat::Json),
            r#"{"type":"failed","frame":"ab"}"#
        );
    }

    #[test]
    fn reply_line() {
        let reply = Packet::Reply(Reply {
            status: 1,
            payload: vec![0x01, 0x00],
        });
        assert_eq!(
            format_packet(&reply, OutputFormat::Text),
            "reply   status=0x01 0100"
        );
    }
}
