//! Built-in service catalog.
//!
//! Default descriptors for the backend services homeport knows how to run out
//! of the box. A project config can override any of these or add its own.

use std::collections::BTreeMap;

use super::{HealthCheck, ServiceDescriptor};

fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Descriptors for the built-in services.
pub fn builtin_services() -> Vec<ServiceDescriptor> {
    vec![
        ServiceDescriptor {
            name: "pgvector".to_string(),
            aliases: strings(&["postgres", "database", "db", "vector", "vectordb", "vector-db"]),
            image: "pgvector/pgvector:pg16".to_string(),
            preferred_port: 5432,
            container_port: Some(5432),
            env: env(&[
                ("POSTGRES_USER", "homeport"),
                ("POSTGRES_PASSWORD", "homeport"),
                ("POSTGRES_DB", "homeport"),
            ]),
            volumes: strings(&["homeport-pgvector-data:/var/lib/postgresql/data"]),
            command: Vec::new(),
            healthcheck: Some(HealthCheck::Tcp),
        },
        ServiceDescriptor {
            name: "redis".to_string(),
            aliases: strings(&["cache"]),
            image: "redis:7-alpine".to_string(),
            preferred_port: 6379,
            container_port: Some(6379),
            env: BTreeMap::new(),
            volumes: strings(&["homeport-redis-data:/data"]),
            command: Vec::new(),
            healthcheck: Some(HealthCheck::Tcp),
        },
        ServiceDescriptor {
            name: "minio".to_string(),
            aliases: strings(&["storage", "s3"]),
            image: "minio/minio:latest".to_string(),
            preferred_port: 9000,
            container_port: Some(9000),
            env: env(&[
                ("MINIO_ROOT_USER", "homeport"),
                ("MINIO_ROOT_PASSWORD", "homeport123"),
            ]),
            volumes: strings(&["homeport-minio-data:/data"]),
            command: strings(&["server", "/data", "--console-address", ":9001"]),
            healthcheck: Some(HealthCheck::Http {
                path: "/minio/health/live".to_string(),
            }),
        },
        ServiceDescriptor {
            name: "ollama".to_string(),
            aliases: strings(&["ai", "llm"]),
            image: "ollama/ollama:latest".to_string(),
            preferred_port: 11434,
            container_port: Some(11434),
            env: BTreeMap::new(),
            volumes: strings(&["homeport-ollama-models:/root/.ollama"]),
            command: Vec::new(),
            healthcheck: Some(HealthCheck::Http {
                path: "/".to_string(),
            }),
        },
        ServiceDescriptor {
            name: "whisper".to_string(),
            aliases: strings(&["stt", "speech-to-text"]),
            image: "onerahmet/openai-whisper-asr-webservice:latest".to_string(),
            preferred_port: 9090,
            container_port: Some(9000),
            env: env(&[("ASR_MODEL", "base")]),
            volumes: Vec::new(),
            command: Vec::new(),
            healthcheck: Some(HealthCheck::Http {
                path: "/docs".to_string(),
            }),
        },
        ServiceDescriptor {
            name: "piper".to_string(),
            aliases: strings(&["tts", "text-to-speech"]),
            image: "lscr.io/linuxserver/piper:latest".to_string(),
            preferred_port: 10200,
            container_port: Some(10200),
            env: env(&[("PIPER_VOICE", "en_US-amy-medium")]),
            volumes: Vec::new(),
            command: Vec::new(),
            healthcheck: Some(HealthCheck::Tcp),
        },
    ]
}
