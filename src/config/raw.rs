use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub global: RawGlobal,
    #[serde(default)]
    pub programs: BTreeMap<String, RawProgram>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawGlobal {
    pub logfile: Option<String>,
    pub loglevel: Option<u64>,
    pub logdir: Option<String>,
    pub ctlserver: Option<String>,
    pub httpserver: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawProgram {
    pub cmd: Option<String>,
    pub numprocs: Option<u64>,
    pub autostart: Option<bool>,
    /// `true|false|always|never|unexpected`; booleans and strings both occur
    /// in the wild, so the scalar is kept raw until conversion.
    pub autorestart: Option<Value>,
    #[serde(default)]
    pub exitcodes: ExitCodeList,
    pub startretries: Option<u64>,
    pub starttime: Option<u64>,
    pub stopsignal: Option<String>,
    pub stoptime: Option<u64>,
    pub workingdir: Option<String>,
    /// Decimal number or leading-zero octal string.
    pub umask: Option<Value>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub discardoutput: Option<bool>,
    #[serde(default)]
    pub env: BTreeMap<String, Value>,
}

/// `exitcodes: 0` and `exitcodes: [0, 2]` are both accepted.
#[derive(Debug, Default)]
pub struct ExitCodeList(pub Vec<i64>);

impl ExitCodeList {
    pub fn into_vec(self) -> Vec<i64> {
        self.0
    }
}

impl<'de> Deserialize<'de> for ExitCodeList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = ExitCodeList;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("an exit code or a list of exit codes")
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ExitCodeList(vec![value]))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ExitCodeList(vec![value as i64]))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut codes = Vec::new();
                while let Some(code) = seq.next_element::<i64>()? {
                    codes.push(code);
                }
                Ok(ExitCodeList(codes))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ExitCodeList(Vec::new()))
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ExitCodeList(Vec::new()))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}
