//! Minimal ONVIF device-service client.
//!
//! Two calls are needed: `GetDeviceInformation` (authenticated, used for
//! the top health tier and for naming discovered cameras) and
//! `GetSystemDateAndTime` (which ONVIF requires devices to answer without
//! credentials).

use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};

use lookout_core::{Device, DeviceMetadata};
use lookout_store::Credentials;

use crate::error::{DiscoverError, Result};

/// Path of the ONVIF device management service.
pub const DEVICE_SERVICE_PATH: &str = "/onvif/device_service";

const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

const GET_DEVICE_INFORMATION: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
    r#"xmlns:tds="http://www.onvif.org/ver10/device/wsdl">"#,
    r#"<s:Body><tds:GetDeviceInformation/></s:Body></s:Envelope>"#,
);

const GET_SYSTEM_DATE_AND_TIME: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
    r#"xmlns:tds="http://www.onvif.org/ver10/device/wsdl">"#,
    r#"<s:Body><tds:GetSystemDateAndTime/></s:Body></s:Envelope>"#,
);

/// Identification block returned by `GetDeviceInformation`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    pub manufacturer: String,
    pub model: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub hardware_id: String,
}

impl DeviceInformation {
    /// Convert to inventory metadata, dropping blank fields.
    pub fn to_metadata(&self) -> DeviceMetadata {
        fn keep(value: &str) -> Option<String> {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        }
        DeviceMetadata {
            manufacturer: keep(&self.manufacturer),
            model: keep(&self.model),
            firmware_version: keep(&self.firmware_version),
            serial_number: keep(&self.serial_number),
            hardware_id: keep(&self.hardware_id),
        }
    }
}

/// The subset of the ONVIF device service used by the prober and the
/// discovery pipeline.
#[async_trait]
pub trait OnvifClient: Send + Sync {
    async fn device_information(
        &self,
        device: &Device,
        credentials: Option<&Credentials>,
    ) -> Result<DeviceInformation>;

    /// Succeeds if the device answers the unauthenticated time query.
    async fn system_date_and_time(&self, device: &Device) -> Result<()>;
}

/// SOAP-over-HTTP implementation backed by `reqwest`.
#[derive(Clone)]
pub struct HttpOnvifClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpOnvifClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { http, timeout })
    }

    async fn call(
        &self,
        device: &Device,
        envelope: &'static str,
        credentials: Option<&Credentials>,
    ) -> Result<String> {
        let endpoint = service_url(device)?;
        let mut request = self
            .http
            .post(&endpoint)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .timeout(self.timeout)
            .body(envelope);
        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DiscoverError::UnexpectedResponse {
                endpoint,
                reason: format!("HTTP {status}"),
            });
        }
        if let Some(reason) = soap_fault(&body) {
            return Err(DiscoverError::UnexpectedResponse { endpoint, reason });
        }
        Ok(body)
    }
}

#[async_trait]
impl OnvifClient for HttpOnvifClient {
    async fn device_information(
        &self,
        device: &Device,
        credentials: Option<&Credentials>,
    ) -> Result<DeviceInformation> {
        let body = self
            .call(device, GET_DEVICE_INFORMATION, credentials)
            .await?;
        parse_device_information(&body)
    }

    async fn system_date_and_time(&self, device: &Device) -> Result<()> {
        let body = self.call(device, GET_SYSTEM_DATE_AND_TIME, None).await?;
        if !body.contains("GetSystemDateAndTimeResponse") {
            return Err(DiscoverError::UnexpectedResponse {
                endpoint: service_url(device)?,
                reason: "no GetSystemDateAndTimeResponse in body".to_string(),
            });
        }
        Ok(())
    }
}

/// `http://host:port/onvif/device_service`, bracketing IPv6 literals.
pub fn service_url(device: &Device) -> Result<String> {
    let endpoint = device.endpoint().ok_or_else(|| DiscoverError::UnexpectedResponse {
        endpoint: device.name.clone(),
        reason: "device has no address".to_string(),
    })?;
    if device.address.contains(':') && !device.address.starts_with('[') {
        return Ok(format!(
            "http://[{}]:{}{DEVICE_SERVICE_PATH}",
            device.address, device.port
        ));
    }
    Ok(format!("http://{endpoint}{DEVICE_SERVICE_PATH}"))
}

/// Extract the `GetDeviceInformationResponse` fields.
pub fn parse_device_information(body: &str) -> Result<DeviceInformation> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut info = DeviceInformation::default();
    let mut in_response = false;
    let mut field: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "GetDeviceInformationResponse" {
                    in_response = true;
                } else if in_response {
                    field = Some(name);
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(name) = field.as_deref() {
                    let value = t
                        .unescape()
                        .map_err(|e| DiscoverError::ProtocolParse(e.to_string()))?
                        .into_owned();
                    match name {
                        "Manufacturer" => info.manufacturer = value,
                        "Model" => info.model = value,
                        "FirmwareVersion" => info.firmware_version = value,
                        "SerialNumber" => info.serial_number = value,
                        "HardwareId" => info.hardware_id = value,
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"GetDeviceInformationResponse" {
                    return Ok(info);
                }
                field = None;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(DiscoverError::ProtocolParse(e.to_string())),
        }
    }

    Err(DiscoverError::ProtocolParse(
        "no GetDeviceInformationResponse in body".to_string(),
    ))
}

/// Return the fault reason if `body` is a SOAP fault.
fn soap_fault(body: &str) -> Option<String> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut in_fault = false;
    let mut in_text = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Fault" => in_fault = true,
                b"Text" | b"faultstring" if in_fault => in_text = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                return Some(
                    t.unescape()
                        .map(|s| s.into_owned())
                        .unwrap_or_else(|_| "SOAP fault".to_string()),
                );
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    in_fault.then(|| "SOAP fault".to_string())
}
