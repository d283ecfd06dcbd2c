//! Representation of the JSON format used by CNI. See the [CNI Specification](https://github.com/containernetworking/cni/blob/master/SPEC.md).
//!
//! Calico predates the `ips` list result format, so results here use the older `ip4`/`ip6` shape.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::{fmt, io};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Exit code used for every error detected by the plugin itself.
pub const ERR_CODE_GENERIC: u32 = 100;

/// Reported in place of an IPv4 address when an endpoint has none.
pub const NO_IPV4_ADDRESS: &str = "0.0.0.0/32";

/// Reported in place of an IPv6 address when an endpoint has none.
pub const NO_IPV6_ADDRESS: &str = "::/128";

/// CNI network configuration, as read from stdin.
///
/// [Specification](https://github.com/containernetworking/cni/blob/master/SPEC.md#network-configuration).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfiguration {
    /// Semantic Version 2.0 of the CNI specification to which this object conforms.
    #[serde(rename = "cniVersion")]
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cni_version: Option<String>,

    /// Network name. Also the name of the profile applied by the default policy drivers.
    pub name: String,

    /// Refers to the filename of the CNI plugin executable.
    #[serde(rename = "type")]
    pub plugin_type: String,

    pub ipam: IpamConfiguration,

    /// Hostname to register endpoints under. Defaults to the system hostname.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Additional arguments provided by the container runtime. Mesos passes its labels here.
    #[serde(default)]
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, Value>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyConfiguration>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesConfiguration>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level_stderr: Option<String>,

    /// `host:port` of a single etcd server.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etcd_authority: Option<String>,

    /// Comma-separated list of etcd URLs. Takes precedence over `etcd_authority`.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etcd_endpoints: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etcd_scheme: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etcd_key_file: Option<PathBuf>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etcd_cert_file: Option<PathBuf>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etcd_ca_cert_file: Option<PathBuf>,

    /// Additional plugin-specific fields, preserved so they can be handed to the IPAM plugin.
    #[serde(flatten)]
    pub other: HashMap<String, Value>,
}

/// IPAM (IP Address Management) plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpamConfiguration {
    /// Refers to the filename of the IPAM plugin executable.
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Pool to allocate from when no pools are configured in the datastore.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<IpNetwork>,

    /// Whether `calico-ipam` assigns an IPv4 address. Defaults to `true`.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_flag")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assign_ipv4: Option<bool>,

    /// Whether `calico-ipam` assigns an IPv6 address. Defaults to `false`.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_flag")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assign_ipv6: Option<bool>,

    /// Additional plugin-specific fields.
    #[serde(flatten)]
    pub other: HashMap<String, Value>,
}

/// Network policy settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfiguration {
    /// Policy mode: `k8s` or `k8s-annotations`. Unset selects the orchestrator default.
    #[serde(rename = "type")]
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_type: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_api_root: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_auth_token: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_client_certificate: Option<PathBuf>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_client_key: Option<PathBuf>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_certificate_authority: Option<PathBuf>,
}

/// Kubernetes-specific settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KubernetesConfiguration {
    /// Kubeconfig file used to reach the API server instead of the `policy` settings.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
}

/// Result of an IPAM plugin invocation, in the `ip4`/`ip6` format.
///
/// Fields other than the addresses (routes, DNS, gateways) are carried through untouched so the
/// result can be echoed back to the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IpamResult {
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip4: Option<IpConfiguration>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip6: Option<IpConfiguration>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// IP configuration for one address family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpConfiguration {
    /// IP address in CIDR notation.
    pub ip: String,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl IpConfiguration {
    pub fn new<S: Into<String>>(ip: S) -> IpConfiguration {
        IpConfiguration {
            ip: ip.into(),
            other: Map::new(),
        }
    }
}

impl IpamResult {
    /// Builds the result reported for an endpoint that already exists, substituting placeholders for missing
    /// address families.
    pub fn from_networks(ipv4: Option<Ipv4Network>, ipv6: Option<Ipv6Network>) -> IpamResult {
        IpamResult {
            ip4: Some(IpConfiguration::new(
                ipv4.map(|net| net.to_string())
                    .unwrap_or_else(|| NO_IPV4_ADDRESS.into()),
            )),
            ip6: Some(IpConfiguration::new(
                ipv6.map(|net| net.to_string())
                    .unwrap_or_else(|| NO_IPV6_ADDRESS.into()),
            )),
            other: Map::new(),
        }
    }

    /// Fills in placeholders for any address family the IPAM plugin did not return.
    pub fn with_placeholders(mut self) -> IpamResult {
        if self.ip4.is_none() {
            self.ip4 = Some(IpConfiguration::new(NO_IPV4_ADDRESS));
        }
        if self.ip6.is_none() {
            self.ip6 = Some(IpConfiguration::new(NO_IPV6_ADDRESS));
        }
        self
    }
}

/// A CNI plugin error. Note that plugins may also log unstructured information to stderr.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniError {
    pub code: ErrorCode,

    #[serde(rename = "msg")]
    pub message: String,

    #[serde(default)]
    pub details: Option<String>,
}

/// A CNI error code. See the [Well-known Error Codes](https://github.com/containernetworking/cni/blob/master/SPEC.md#well-known-error-codes).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    IncompatibleCniVersion,
    UnsupportedConfigurationField,
    ContainerUnknown,
    InvalidEnvironmentVariable,
    Io,
    Decode,
    InvalidNetworkConfiguration,
    Transient,
    Reserved(u32),
    /// Calico's catch-all code, [`ERR_CODE_GENERIC`].
    Generic,
    Plugin(u32),
}

impl CniError {
    /// An error with the generic Calico error code.
    pub fn generic<S: Into<String>>(message: S) -> CniError {
        CniError {
            code: ErrorCode::Generic,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details<S: Into<String>>(mut self, details: S) -> CniError {
        self.details = Some(details.into());
        self
    }

    /// Process exit code to report this error with.
    pub fn exit_code(&self) -> i32 {
        self.code.value() as i32
    }

    /// Writes the error as JSON, the way runtimes expect to read it from a failed plugin.
    pub fn write_to<W: io::Write>(&self, mut out: W) -> io::Result<()> {
        serde_json::to_writer(&mut out, self)?;
        writeln!(out)
    }
}

impl fmt::Display for CniError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CNI error ({}): {}", self.code, self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for CniError {}

impl ErrorCode {
    pub fn value(&self) -> u32 {
        match self {
            ErrorCode::IncompatibleCniVersion => 1,
            ErrorCode::UnsupportedConfigurationField => 2,
            ErrorCode::ContainerUnknown => 3,
            ErrorCode::InvalidEnvironmentVariable => 4,
            ErrorCode::Io => 5,
            ErrorCode::Decode => 6,
            ErrorCode::InvalidNetworkConfiguration => 7,
            ErrorCode::Transient => 11,
            ErrorCode::Generic => ERR_CODE_GENERIC,
            ErrorCode::Reserved(code) | ErrorCode::Plugin(code) => *code,
        }
    }
}

impl From<u32> for ErrorCode {
    fn from(value: u32) -> ErrorCode {
        match value {
            1 => ErrorCode::IncompatibleCniVersion,
            2 => ErrorCode::UnsupportedConfigurationField,
            3 => ErrorCode::ContainerUnknown,
            4 => ErrorCode::InvalidEnvironmentVariable,
            5 => ErrorCode::Io,
            6 => ErrorCode::Decode,
            7 => ErrorCode::InvalidNetworkConfiguration,
            11 => ErrorCode::Transient,
            ERR_CODE_GENERIC => ErrorCode::Generic,
            8 | 9 | 12..=99 => ErrorCode::Reserved(value),
            _ => ErrorCode::Plugin(value),
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(self.value())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<ErrorCode, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        struct ErrorCodeVisitor;

        impl<'de> de::Visitor<'de> for ErrorCodeVisitor {
            type Value = ErrorCode;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a CNI error code")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value > u32::MAX as u64 {
                    return Err(E::invalid_value(de::Unexpected::Unsigned(value), &self));
                }
                Ok(ErrorCode::from(value as u32))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::invalid_value(de::Unexpected::Signed(value), &self));
                }
                self.visit_u64(value as u64)
            }

            // Some IPAM plugins report the code as a string
            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value
                    .trim()
                    .parse::<u32>()
                    .map(ErrorCode::from)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_any(ErrorCodeVisitor)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorCode::IncompatibleCniVersion => f.write_str("Incompatible CNI version"),
            ErrorCode::UnsupportedConfigurationField => {
                f.write_str("Unsupported field in network configuration")
            }
            ErrorCode::ContainerUnknown => f.write_str("Container unknown or does not exist"),
            ErrorCode::InvalidEnvironmentVariable => {
                f.write_str("Invalid necessary environment variables")
            }
            ErrorCode::Io => f.write_str("I/O failure"),
            ErrorCode::Decode => f.write_str("Failed to decode content"),
            ErrorCode::InvalidNetworkConfiguration => f.write_str("Invalid network config"),
            ErrorCode::Transient => f.write_str("Try again later"),
            ErrorCode::Reserved(code) => write!(f, "reserved error {}", code),
            ErrorCode::Generic => write!(f, "Calico error {}", ERR_CODE_GENERIC),
            ErrorCode::Plugin(code) => write!(f, "plugin-specific error {}", code),
        }
    }
}

/// Accepts both `true` and `"true"`, since older configurations quote the IPAM flags.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Flag::Bool(value)) => Ok(Some(value)),
        Some(Flag::Text(value)) => Ok(Some(value.eq_ignore_ascii_case("true"))),
    }
}

/// Parses an address reported by an IPAM plugin. A bare address is treated as a single-host network.
pub fn parse_address(value: &str) -> Result<IpNetwork, ipnetwork::IpNetworkError> {
    match value.parse::<IpNetwork>() {
        Ok(net) => Ok(net),
        Err(err) => match value.parse::<IpAddr>() {
            Ok(addr) => Ok(IpNetwork::from(addr)),
            Err(_) => Err(err),
        },
    }
}
