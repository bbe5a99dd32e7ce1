//! The built-in status modes: operator (+o, rank 100, `@`) and voice
//! (+v, rank 10, `+`).
//!
//! The operator module also supplies the baseline `checkchannellevel`
//! answer: channel operators pass every level check.

use std::rc::Rc;

use crate::hooks::{ActionArgs, ActionValue};
use crate::modes::{ModeCategory, ModeHandler};
use crate::modules::{ActionDef, ChannelModeDef, Module};

/// Status modes carry no behavior beyond their rank and symbol; the mode
/// engine resolves and applies the membership change.
struct StatusHandler;

impl ModeHandler for StatusHandler {}

pub struct StatusOp;

impl Module for StatusOp {
    fn name(&self) -> &'static str {
        "StatusOp"
    }

    fn is_core(&self) -> bool {
        true
    }

    fn channel_modes(&self) -> Vec<ChannelModeDef> {
        vec![ChannelModeDef {
            letter: 'o',
            category: ModeCategory::Status,
            handler: Rc::new(StatusHandler),
            rank: Some(100),
            symbol: Some('@'),
            affected_actions: Vec::new(),
        }]
    }

    fn actions(&self) -> Vec<ActionDef> {
        vec![ActionDef {
            action: "checkchannellevel".to_string(),
            priority: 1,
            func: Rc::new(|ircd, args| {
                let ActionArgs::ChannelLevel { channel, user, .. } = args else {
                    return None;
                };
                let rank = ircd
                    .channels
                    .get(channel)
                    .map(|c| c.user_rank(&ircd.registry.modes, *user))
                    .unwrap_or(0);
                if rank >= 100 {
                    Some(ActionValue::Bool(true))
                } else {
                    None
                }
            }),
            scope: None,
        }]
    }
}

pub struct StatusVoice;

impl Module for StatusVoice {
    fn name(&self) -> &'static str {
        "StatusVoice"
    }

    fn is_core(&self) -> bool {
        true
    }

    fn channel_modes(&self) -> Vec<ChannelModeDef> {
        vec![ChannelModeDef {
            letter: 'v',
            category: ModeCategory::Status,
            handler: Rc::new(StatusHandler),
            rank: Some(10),
            symbol: Some('+'),
            affected_actions: Vec::new(),
        }]
    }
}
