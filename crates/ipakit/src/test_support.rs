//! Shared fakes for unit tests.

use crate::tools::{ToolOutput, ToolRunner};
use crate::Result;
use std::ffi::OsString;
use std::sync::Mutex;

type Responder = dyn Fn(&str, &[String]) -> ToolOutput + Send + Sync;

/// Records every invocation and answers with a scripted response.
pub struct ScriptedRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    responder: Box<Responder>,
}

impl ScriptedRunner {
    pub fn new(responder: impl Fn(&str, &[String]) -> ToolOutput + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    /// Every call succeeds with empty output.
    pub fn succeeding() -> Self {
        Self::new(|_, _| ok(""))
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations whose first argument equals `subcommand`.
    pub fn calls_to(&self, program: &str, subcommand: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(p, a)| p == program && a.first().map(String::as_str) == Some(subcommand))
            .map(|(_, a)| a)
            .collect()
    }
}

impl ToolRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<ToolOutput> {
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.clone()));
        Ok((self.responder)(program, &args))
    }
}

pub fn ok(stdout: &str) -> ToolOutput {
    ToolOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed(stderr: &str) -> ToolOutput {
    ToolOutput {
        status: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Throwaway RSA key and self-signed certificate.
pub fn test_identity() -> (
    openssl::pkey::PKey<openssl::pkey::Private>,
    openssl::x509::X509,
) {
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};

    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "iPhone Distribution: Test Team")
        .unwrap();
    name.append_entry_by_text("OU", "ABCDE12345").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    (key, builder.build())
}

/// Profile plist with one developer certificate.
pub fn profile_plist(application_identifier: &str, ad_hoc: bool, cert_der: &[u8]) -> Vec<u8> {
    use plist::{Dictionary, Value};

    let mut entitlements = Dictionary::new();
    entitlements.insert(
        "application-identifier".into(),
        Value::String(application_identifier.into()),
    );
    entitlements.insert("get-task-allow".into(), Value::Boolean(false));

    let mut doc = Dictionary::new();
    doc.insert("Name".into(), Value::String("Test Profile".into()));
    doc.insert(
        "DeveloperCertificates".into(),
        Value::Array(vec![Value::Data(cert_der.to_vec())]),
    );
    doc.insert("Entitlements".into(), Value::Dictionary(entitlements));
    if ad_hoc {
        doc.insert(
            "ProvisionedDevices".into(),
            Value::Array(vec![Value::String("00008030-001A2B3C4D5E6F70".into())]),
        );
    }

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(doc)).unwrap();
    buf
}

/// Wraps `content` in a PKCS#7 signed-data envelope.
pub fn signed_profile(
    content: &[u8],
    key: &openssl::pkey::PKey<openssl::pkey::Private>,
    cert: &openssl::x509::X509,
) -> Vec<u8> {
    use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
    use openssl::stack::Stack;

    let certs = Stack::new().unwrap();
    Pkcs7::sign(
        cert,
        key,
        &certs,
        content,
        Pkcs7Flags::BINARY | Pkcs7Flags::NOSMIMECAP,
    )
    .unwrap()
    .to_der()
    .unwrap()
}
