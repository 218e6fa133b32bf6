//! Azure IoT Hub device client over MQTT.
//!
//! IoT Hub speaks MQTT 3.1.1 on port 8883 (TLS only). The device
//! authenticates with a SAS token derived from its shared access key and
//! sends device-to-cloud messages to `devices/<id>/messages/events/`.

use anyhow::{anyhow, Context, Result};
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, Incoming, MqttOptions, Outgoing, QoS, Transport,
};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::TelemetrySink;
use crate::signing::{parse_key_value_pairs, url_encode, SharedKey};

pub const DEFAULT_SAS_TTL: Duration = Duration::from_secs(60 * 60 * 24);

const IOT_HUB_PORT: u16 = 8883;
const IOT_HUB_API_VERSION: &str = "2021-04-12";
const KEEP_ALIVE: Duration = Duration::from_secs(60);
// Reconnect with a fresh token this long before the current one expires.
const RENEW_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Parsed device connection string
/// (`HostName=<hub>.azure-devices.net;DeviceId=<id>;SharedAccessKey=<key>`).
#[derive(Clone, Debug)]
pub struct IotHubConnectionString {
    pub host_name: String,
    pub device_id: String,
    key: SharedKey,
}

impl IotHubConnectionString {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut host_name = None;
        let mut device_id = None;
        let mut key = None;
        for (name, value) in parse_key_value_pairs(raw)? {
            match name.as_str() {
                "HostName" => host_name = Some(value),
                "DeviceId" => device_id = Some(value),
                "SharedAccessKey" => key = Some(value),
                "x509" => return Err(anyhow!("x509 device authentication is not supported")),
                other => log::debug!("ignoring iot hub connection string key {}", other),
            }
        }
        let host_name = host_name
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("iot hub connection string is missing HostName"))?;
        let device_id = device_id
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("iot hub connection string is missing DeviceId"))?;
        let key = key.ok_or_else(|| anyhow!("iot hub connection string is missing SharedAccessKey"))?;
        Ok(Self {
            host_name,
            device_id,
            key: SharedKey::from_base64(&key).context("invalid SharedAccessKey")?,
        })
    }

    pub fn username(&self) -> String {
        format!(
            "{}/{}/?api-version={}",
            self.host_name, self.device_id, IOT_HUB_API_VERSION
        )
    }

    pub fn events_topic(&self) -> String {
        format!("devices/{}/messages/events/", self.device_id)
    }

    fn resource_uri(&self) -> String {
        format!("{}/devices/{}", self.host_name, self.device_id)
    }

    /// SAS token valid until `expiry_epoch_s`.
    pub fn sas_token(&self, expiry_epoch_s: u64) -> Result<String> {
        sas_token(&self.resource_uri(), &self.key, expiry_epoch_s)
    }
}

/// `SharedAccessSignature sr=..&sig=..&se=..` for a resource URI.
fn sas_token(resource_uri: &str, key: &SharedKey, expiry_epoch_s: u64) -> Result<String> {
    let encoded_uri = url_encode(resource_uri);
    let signature = key.sign(&format!("{}\n{}", encoded_uri, expiry_epoch_s))?;
    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        encoded_uri,
        url_encode(&signature),
        expiry_epoch_s
    ))
}

enum LinkEvent {
    Connected,
    Rejected(String),
    /// A PUBLISH left the client with this packet id.
    Sent(u16),
    PubAck(u16),
    Down(String),
}

#[derive(Debug, PartialEq, Eq)]
enum AckFailure {
    Timeout,
    LinkDown(String),
}

/// Wait for the PUBACK of the next PUBLISH the connection sends. Acks for
/// other packet ids (late acks of earlier, timed-out publishes) are skipped.
fn wait_for_puback(events: &Receiver<LinkEvent>, timeout: Duration) -> Result<u16, AckFailure> {
    let deadline = Instant::now() + timeout;
    let mut sent = None;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(LinkEvent::Sent(pkid)) if sent.is_none() => sent = Some(pkid),
            Ok(LinkEvent::PubAck(pkid)) if sent == Some(pkid) => return Ok(pkid),
            Ok(LinkEvent::PubAck(pkid)) => log::debug!("ignoring PUBACK for packet {}", pkid),
            Ok(LinkEvent::Down(e)) | Ok(LinkEvent::Rejected(e)) => {
                return Err(AckFailure::LinkDown(e))
            }
            Ok(_) => continue,
            Err(RecvTimeoutError::Timeout) => return Err(AckFailure::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(AckFailure::LinkDown("connection thread exited".to_string()))
            }
        }
    }
}

struct MqttLink {
    client: Client,
    events: Receiver<LinkEvent>,
    connection_handle: Option<JoinHandle<()>>,
    renew_at: Instant,
    down: bool,
}

impl MqttLink {
    fn open(conn: &IotHubConnectionString, sas_ttl: Duration, timeout: Duration) -> Result<Self> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        let expiry = now.as_secs() + sas_ttl.as_secs();
        let token = conn.sas_token(expiry)?;

        let mut options = MqttOptions::new(&conn.device_id, &conn.host_name, IOT_HUB_PORT);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_credentials(conn.username(), token);
        options.set_transport(Transport::tls_with_default_config());

        let (client, connection) = Client::new(options, 10);
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || drive_connection(connection, tx));

        let mut link = Self {
            client,
            events: rx,
            connection_handle: Some(handle),
            renew_at: Instant::now() + sas_ttl.saturating_sub(RENEW_MARGIN),
            down: false,
        };
        match link.events.recv_timeout(timeout) {
            Ok(LinkEvent::Connected) => Ok(link),
            Ok(LinkEvent::Rejected(code)) => {
                let _ = link.shutdown();
                Err(anyhow!("iot hub rejected the connection: {}", code))
            }
            Ok(LinkEvent::Down(e)) => {
                let _ = link.shutdown();
                Err(anyhow!("iot hub connection failed: {}", e))
            }
            Ok(LinkEvent::Sent(_)) | Ok(LinkEvent::PubAck(_)) => {
                let _ = link.shutdown();
                Err(anyhow!("unexpected publish traffic before CONNACK"))
            }
            Err(_) => {
                let _ = link.shutdown();
                Err(anyhow!("no CONNACK from iot hub within {:?}", timeout))
            }
        }
    }

    fn needs_reconnect(&self) -> bool {
        self.down || Instant::now() >= self.renew_at
    }

    // Acks or errors left over from earlier publishes.
    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let LinkEvent::Down(e) = event {
                log::warn!("iot hub connection lost: {}", e);
                self.down = true;
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8], timeout: Duration) -> Result<()> {
        self.drain();
        if self.down {
            return Err(anyhow!("iot hub connection is down"));
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .context("queue iot hub message")?;

        match wait_for_puback(&self.events, timeout) {
            Ok(pkid) => {
                log::debug!("PUBACK for packet {}", pkid);
                Ok(())
            }
            Err(AckFailure::Timeout) => {
                // The unacked message may still surface on this link; start over.
                self.down = true;
                Err(anyhow!("no PUBACK from iot hub within {:?}", timeout))
            }
            Err(AckFailure::LinkDown(e)) => {
                self.down = true;
                Err(anyhow!("iot hub connection lost: {}", e))
            }
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        // A link marked down after an ack timeout still has a live thread,
        // so the disconnect is always sent. It can only fail if that thread
        // has already exited.
        let disconnect = self.client.disconnect().context("disconnect from iot hub");
        let result = if self.down { Ok(()) } else { disconnect };
        self.down = true;
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        result
    }
}

fn drive_connection(mut connection: Connection, tx: Sender<LinkEvent>) {
    for event in connection.iter() {
        let forwarded = match event {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    tx.send(LinkEvent::Connected)
                } else {
                    let _ = tx.send(LinkEvent::Rejected(format!("{:?}", ack.code)));
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => tx.send(LinkEvent::Sent(pkid)),
            Ok(Event::Incoming(Incoming::PubAck(ack))) => tx.send(LinkEvent::PubAck(ack.pkid)),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => Ok(()),
            Err(e) => {
                let _ = tx.send(LinkEvent::Down(e.to_string()));
                break;
            }
        };
        if forwarded.is_err() {
            break;
        }
    }
}

/// Telemetry sink publishing detection metadata to IoT Hub.
pub struct IotHubClient {
    conn: IotHubConnectionString,
    topic: String,
    sas_ttl: Duration,
    timeout: Duration,
    link: Option<MqttLink>,
}

impl IotHubClient {
    /// Connect and wait for the hub to accept the device.
    pub fn connect(conn: IotHubConnectionString, sas_ttl: Duration, timeout: Duration) -> Result<Self> {
        if sas_ttl <= RENEW_MARGIN {
            return Err(anyhow!(
                "sas token lifetime must exceed {}s",
                RENEW_MARGIN.as_secs()
            ));
        }
        let link = MqttLink::open(&conn, sas_ttl, timeout)?;
        log::info!(
            "connected to iot hub {} as device {}",
            conn.host_name,
            conn.device_id
        );
        Ok(Self {
            topic: conn.events_topic(),
            conn,
            sas_ttl,
            timeout,
            link: Some(link),
        })
    }

    fn ensure_link(&mut self) -> Result<&mut MqttLink> {
        let stale = match &self.link {
            Some(link) => link.needs_reconnect(),
            None => true,
        };
        if stale {
            if let Some(mut old) = self.link.take() {
                if let Err(e) = old.shutdown() {
                    log::debug!("closing stale iot hub link: {:#}", e);
                }
            }
            log::info!("reconnecting to iot hub with a fresh sas token");
            self.link = Some(MqttLink::open(&self.conn, self.sas_ttl, self.timeout)?);
        }
        self.link
            .as_mut()
            .ok_or_else(|| anyhow!("iot hub link unavailable"))
    }
}

impl TelemetrySink for IotHubClient {
    fn publish(&mut self, document: &str) -> Result<()> {
        let topic = self.topic.clone();
        let timeout = self.timeout;
        self.ensure_link()?
            .publish(&topic, document.as_bytes(), timeout)?;
        log::info!("metadata message sent to iot hub");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.link.take() {
            Some(mut link) => {
                link.shutdown()?;
                log::info!("disconnected from iot hub");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for IotHubClient {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    fn conn_string() -> String {
        format!(
            "HostName=myhub.azure-devices.net;DeviceId=feeder-pi;SharedAccessKey={}",
            KEY
        )
    }

    #[test]
    fn parses_device_connection_string() {
        let conn = IotHubConnectionString::parse(&conn_string()).expect("parse");
        assert_eq!(conn.host_name, "myhub.azure-devices.net");
        assert_eq!(conn.device_id, "feeder-pi");
    }

    #[test]
    fn rejects_incomplete_connection_strings() {
        assert!(IotHubConnectionString::parse("HostName=h;DeviceId=d").is_err());
        assert!(IotHubConnectionString::parse("DeviceId=d;SharedAccessKey=SmVmZQ==").is_err());
        assert!(IotHubConnectionString::parse("HostName=h;DeviceId=d;x509=true").is_err());
        assert!(IotHubConnectionString::parse("HostName=h;DeviceId=d;SharedAccessKey=@@").is_err());
    }

    #[test]
    fn sas_token_matches_reference() {
        let conn = IotHubConnectionString::parse(&conn_string()).expect("parse");
        assert_eq!(
            conn.sas_token(1_700_000_000).expect("token"),
            "SharedAccessSignature sr=myhub.azure-devices.net%2Fdevices%2Ffeeder-pi&sig=EpkGBwgacbF2xR80MI3pcq3CY%2Ffq%2BbR79ZEmYm2eidw%3D&se=1700000000"
        );
    }

    #[test]
    fn username_and_topic_follow_iot_hub_conventions() {
        let conn = IotHubConnectionString::parse(&conn_string()).expect("parse");
        assert_eq!(
            conn.username(),
            "myhub.azure-devices.net/feeder-pi/?api-version=2021-04-12"
        );
        assert_eq!(conn.events_topic(), "devices/feeder-pi/messages/events/");
    }

    #[test]
    fn puback_is_matched_by_packet_id() {
        let (tx, rx) = mpsc::channel();
        // Late ack of an earlier publish, then our send and its ack.
        tx.send(LinkEvent::PubAck(1)).unwrap();
        tx.send(LinkEvent::Sent(2)).unwrap();
        tx.send(LinkEvent::PubAck(1)).unwrap();
        tx.send(LinkEvent::PubAck(2)).unwrap();
        assert_eq!(wait_for_puback(&rx, Duration::from_millis(200)), Ok(2));
    }

    #[test]
    fn stale_puback_does_not_confirm_lost_publish() {
        let (tx, rx) = mpsc::channel();
        tx.send(LinkEvent::Sent(7)).unwrap();
        tx.send(LinkEvent::PubAck(6)).unwrap();
        assert_eq!(
            wait_for_puback(&rx, Duration::from_millis(50)),
            Err(AckFailure::Timeout)
        );
    }

    #[test]
    fn ack_wait_reports_dropped_connection() {
        let (tx, rx) = mpsc::channel();
        tx.send(LinkEvent::Sent(3)).unwrap();
        tx.send(LinkEvent::Down("connection reset".to_string())).unwrap();
        assert_eq!(
            wait_for_puback(&rx, Duration::from_millis(200)),
            Err(AckFailure::LinkDown("connection reset".to_string()))
        );

        let (tx, rx) = mpsc::channel::<LinkEvent>();
        drop(tx);
        assert!(matches!(
            wait_for_puback(&rx, Duration::from_millis(200)),
            Err(AckFailure::LinkDown(_))
        ));
    }

    #[test]
    fn connect_rejects_short_token_lifetime() {
        let conn = IotHubConnectionString::parse(&conn_string()).expect("parse");
        let err = IotHubClient::connect(conn, Duration::from_secs(60), Duration::from_secs(1))
            .err()
            .expect("error");
        assert!(err.to_string().contains("sas token lifetime"));
    }
}
