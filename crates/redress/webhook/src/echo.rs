/// The acknowledgment body the gateway expects for every notification.
pub fn echo_body(unique_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <notification_echo><unique_id>{}</unique_id></notification_echo>",
        escape(unique_id)
    )
}

fn escape(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '&' => "&amp;".to_string(),
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            c => c.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_contains_the_unique_id() {
        let body = echo_body("txn-123");
        assert!(body.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(body.contains("<unique_id>txn-123</unique_id>"));
    }

    #[test]
    fn markup_in_ids_is_escaped() {
        assert!(echo_body("a<b&c").contains("<unique_id>a&lt;b&amp;c</unique_id>"));
    }
}
