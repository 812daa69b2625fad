//! User-facing text for generation failures.
//!
//! Errors reach the UI through the same stream events as answers, so they
//! have to read as a reply. Strings for languages not listed here come from
//! the host's string loader; this table is the fallback.

use crate::error::{GenerationError, GenerationErrorKind};

fn english(kind: GenerationErrorKind) -> &'static str {
    match kind {
        GenerationErrorKind::LanguageModelUnavailable => {
            "The on-device language model isn't available. Check that it is installed and running, then try again."
        }
        GenerationErrorKind::LanguageModelCreationFailed => {
            "The language model couldn't be started. Please try again in a moment."
        }
        GenerationErrorKind::QuotaExceeded => {
            "This conversation is too long for the model. Start a new description to continue."
        }
        GenerationErrorKind::NetworkError => {
            "Lost the connection to the language model while generating. Please try again."
        }
        GenerationErrorKind::ImageProcessingError => {
            "The image couldn't be processed. Try a different image or capture the page again."
        }
        GenerationErrorKind::SessionNotFound => {
            "This conversation has expired. Start a new description to continue."
        }
        GenerationErrorKind::DeliveryFailed => {
            "Couldn't reach the description service. Please try again."
        }
        GenerationErrorKind::Generic => "Something went wrong while generating the description.",
    }
}

fn spanish(kind: GenerationErrorKind) -> &'static str {
    match kind {
        GenerationErrorKind::LanguageModelUnavailable => {
            "El modelo de lenguaje local no está disponible. Comprueba que esté instalado y en ejecución."
        }
        GenerationErrorKind::LanguageModelCreationFailed => {
            "No se pudo iniciar el modelo de lenguaje. Inténtalo de nuevo en un momento."
        }
        GenerationErrorKind::QuotaExceeded => {
            "Esta conversación es demasiado larga para el modelo. Empieza una nueva descripción."
        }
        GenerationErrorKind::NetworkError => {
            "Se perdió la conexión con el modelo de lenguaje. Inténtalo de nuevo."
        }
        GenerationErrorKind::ImageProcessingError => {
            "No se pudo procesar la imagen. Prueba con otra imagen."
        }
        GenerationErrorKind::SessionNotFound => {
            "Esta conversación ha caducado. Empieza una nueva descripción."
        }
        GenerationErrorKind::DeliveryFailed => {
            "No se pudo contactar con el servicio de descripción. Inténtalo de nuevo."
        }
        GenerationErrorKind::Generic => "Algo salió mal al generar la descripción.",
    }
}

/// Localized message for an error kind. `language` is a BCP-47 tag.
pub fn error_text(kind: GenerationErrorKind, language: &str) -> &'static str {
    let primary = language.split(['-', '_']).next().unwrap_or_default();
    match primary.to_ascii_lowercase().as_str() {
        "es" => spanish(kind),
        _ => english(kind),
    }
}

/// What the user sees for a failed generation.
///
/// Partial text from an aborted stream is shown as the answer.
pub fn user_message(err: &GenerationError, language: &str) -> String {
    match err.partial() {
        Some(partial) => partial.to_string(),
        None => error_text(err.kind(), language).to_string(),
    }
}
