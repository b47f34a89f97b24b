//! Context window selection
//!
//! A conversation is materialized oldest-first as whole user/assistant pairs
//! followed by one trailing, unanswered user turn. User turns therefore sit at
//! even indices and every window starts on one.

use parley_runtime::Turn;

/// The suffix of a conversation sent to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Index of the first kept turn.
    pub cut: usize,
    /// Number of turns in the full conversation, new user turn included.
    pub len: usize,
    /// System instruction tokens plus the kept turns' tokens.
    pub input_tokens: usize,
}

impl Window {
    pub fn kept(&self) -> usize {
        self.len - self.cut
    }

    /// Only the trailing user turn is left.
    pub fn is_minimal(&self) -> bool {
        self.cut + 1 >= self.len
    }
}

/// Smallest even `cut` with `system + sum(turns[cut..]) < ceiling`.
///
/// Pairs are dropped oldest first. When nothing fits, the window degrades to
/// the trailing user turn alone; it is never empty.
pub fn cut_index(system_tokens: usize, turn_tokens: &[usize], ceiling: usize) -> Window {
    let len = turn_tokens.len();
    let Some(&last) = turn_tokens.last() else {
        return Window {
            cut: 0,
            len,
            input_tokens: system_tokens,
        };
    };

    let mut cut = len - 1;
    let mut total = system_tokens + last;
    while cut >= 2 {
        let pair = turn_tokens[cut - 2] + turn_tokens[cut - 1];
        if total + pair >= ceiling {
            break;
        }
        total += pair;
        cut -= 2;
    }

    Window {
        cut,
        len,
        input_tokens: total,
    }
}

/// Drop one more pair after the provider rejected `window` as too long.
pub fn shrink(window: Window, turn_tokens: &[usize]) -> Option<Window> {
    if window.is_minimal() {
        return None;
    }

    let cut = (window.cut + 2).min(window.len - 1);
    let removed: usize = turn_tokens[window.cut..cut].iter().sum();
    Some(Window {
        cut,
        len: window.len,
        input_tokens: window.input_tokens - removed,
    })
}

/// A fully materialized request: system instruction plus every turn of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub system: String,
    pub system_tokens: usize,
    pub turns: Vec<Turn>,
    pub turn_tokens: Vec<usize>,
}

impl Conversation {
    pub fn fit(&self, ceiling: usize) -> Window {
        cut_index(self.system_tokens, &self.turn_tokens, ceiling)
    }

    pub fn shrink(&self, window: Window) -> Option<Window> {
        shrink(window, &self.turn_tokens)
    }

    pub fn kept(&self, window: &Window) -> &[Turn] {
        &self.turns[window.cut..]
    }
}
