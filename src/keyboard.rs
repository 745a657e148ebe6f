//! Atajos de teclado de la pantalla de revisión.
//!
//! | tecla             | acción                                          |
//! |-------------------|-------------------------------------------------|
//! | `1`..`9`          | fusionar con el candidato N y enviar            |
//! | `Enter`           | enviar la decisión actual                       |
//! | `i`               | marcar como inválida y enviar                   |
//! | `n`               | foco en el campo "nueva entidad"                |
//! | `f`               | foco en el filtro                               |
//! | `s`               | buscar el nombre en un buscador externo         |
//! | `ArrowUp`/`Down`  | mover la selección (se detiene en los extremos) |
//! | `Escape`          | quitar el foco del campo activo                 |
//!
//! Mientras un campo de texto tiene el foco sólo se atiende `Escape`.

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

/// Pulsación enviada por el navegador. `key` sigue los nombres de
/// `KeyboardEvent.key`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyEvent {
    pub key: String,
    #[serde(default)]
    pub input_focused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "command", content = "value", rename_all = "snake_case")]
pub enum KeyCommand {
    /// Índice (desde 0) del candidato elegido como destino de la fusión.
    SelectCandidate(usize),
    Submit,
    MarkInvalid,
    FocusNewEntity,
    FocusFilter,
    ExternalSearch,
    MoveSelection(Direction),
    Blur,
    Ignore,
}

/// Traduce una pulsación a una orden sobre la lista de `rendered` candidatos.
pub fn dispatch(event: &KeyEvent, rendered: usize) -> KeyCommand {
    let key = event.key.as_str();
    if matches!(key, "Escape" | "Esc") {
        return KeyCommand::Blur;
    }
    if event.input_focused {
        return KeyCommand::Ignore;
    }

    match key {
        "Enter" => KeyCommand::Submit,
        "i" | "I" => KeyCommand::MarkInvalid,
        "n" | "N" => KeyCommand::FocusNewEntity,
        "f" | "F" => KeyCommand::FocusFilter,
        "s" | "S" => KeyCommand::ExternalSearch,
        "ArrowUp" | "Up" => KeyCommand::MoveSelection(Direction::Up),
        "ArrowDown" | "Down" => KeyCommand::MoveSelection(Direction::Down),
        digit => match digit.parse::<usize>() {
            Ok(n @ 1..=9) if n <= rendered => KeyCommand::SelectCandidate(n - 1),
            _ => KeyCommand::Ignore,
        },
    }
}

/// Mueve la selección una posición. En los extremos se queda donde está;
/// sin selección previa, cualquier dirección elige el primer candidato.
pub fn move_selection(current: Option<usize>, len: usize, direction: Direction) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let last = len - 1;
    Some(match (current, direction) {
        (None, _) => 0,
        (Some(i), Direction::Up) => i.min(last).saturating_sub(1),
        (Some(i), Direction::Down) => (i + 1).min(last),
    })
}

/// URL de búsqueda externa para el nombre de la entidad.
pub fn external_search_url(base: &str, name: &str) -> String {
    let query: String = form_urlencoded::byte_serialize(name.as_bytes()).collect();
    format!("{base}{query}")
}
