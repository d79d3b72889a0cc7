pub mod artifact_service;
