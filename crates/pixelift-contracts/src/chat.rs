use serde::{Deserialize, Serialize};

/// One prior exchange in the assistant conversation, as the page submits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "usuario".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "asistente".to_string(),
            content: content.into(),
        }
    }
}

/// Renders the running conversation plus the new message into the prompt the
/// chat model expects: one `role: content` line per turn, then the pending
/// user line and an open assistant line.
pub fn render_prompt(history: &[ChatTurn], message: &str) -> String {
    let rendered = history
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.content))
        .collect::<Vec<String>>()
        .join("\n");
    format!("{rendered}\nusuario: {message}\nasistente:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_keeps_history_order_and_open_assistant_line() {
        let history = vec![
            ChatTurn::user("hola"),
            ChatTurn::assistant("¡Hola! ¿En qué puedo ayudarte?"),
        ];
        let prompt = render_prompt(&history, "dime un chiste");
        assert_eq!(
            prompt,
            "usuario: hola\nasistente: ¡Hola! ¿En qué puedo ayudarte?\nusuario: dime un chiste\nasistente:"
        );
    }

    #[test]
    fn empty_history_still_renders_the_pending_message() {
        let prompt = render_prompt(&[], "hola");
        assert_eq!(prompt, "\nusuario: hola\nasistente:");
    }

    #[test]
    fn turns_round_trip_through_json() {
        let history = vec![ChatTurn::user("uno"), ChatTurn::assistant("dos")];
        let raw = serde_json::to_string(&history).unwrap_or_default();
        let parsed: Vec<ChatTurn> = serde_json::from_str(&raw).unwrap_or_default();
        assert_eq!(parsed, history);
    }
}
