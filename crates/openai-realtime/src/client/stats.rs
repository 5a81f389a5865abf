/// Token usage accumulated over every `response.done` seen by a client.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Stats {
    responses: u32,
    total_tokens: i32,
    input_tokens: i32,
    output_tokens: i32,
}

impl Stats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn update_usage(&mut self, total: i32, input: i32, output: i32) {
        self.responses += 1;
        self.total_tokens += total;
        self.input_tokens += input;
        self.output_tokens += output;
    }

    pub fn responses(&self) -> u32 {
        self.responses
    }

    pub fn total_tokens(&self) -> i32 {
        self.total_tokens
    }

    pub fn input_tokens(&self) -> i32 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> i32 {
        self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_usage_accumulates() {
        let mut stats = Stats::new();
        stats.update_usage(30, 10, 20);
        stats.update_usage(5, 2, 3);
        assert_eq!(stats.responses(), 2);
        assert_eq!(stats.total_tokens(), 35);
        assert_eq!(stats.input_tokens(), 12);
        assert_eq!(stats.output_tokens(), 23);
    }
}
