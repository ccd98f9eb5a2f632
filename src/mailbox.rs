// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Per-participant message ring in world shared memory.
//
// All cross-participant traffic — reactor notifications for remote
// listeners, call requests to an owner, call replies back to a caller —
// travels through the target participant's mailbox. The ring is guarded by
// the participant's robust mutex; the paired condvar is broadcast both when
// a message is pushed (wakes drainers) and when slots free up (wakes
// pushers blocked on a full ring).

use crate::shm_pool::SharedRef;

/// Slots per participant mailbox.
pub const MAIL_SLOTS: usize = 64;

/// Inline payload bytes per slot. Notification payload types and call
/// request payloads must fit in this.
pub const MAIL_DATA: usize = 128;

pub(crate) const MSG_NOTIFICATION: u32 = 1;
pub(crate) const MSG_CALL_REQUEST: u32 = 2;
pub(crate) const MSG_CALL_REPLY: u32 = 3;

/// Reply status codes carried in a `MSG_CALL_REPLY` slot.
pub(crate) const REPLY_OK: u32 = 0;
pub(crate) const REPLY_DESTROYED: u32 = 1;

// ---------------------------------------------------------------------------
// Shared memory layout
// ---------------------------------------------------------------------------

#[repr(C)]
struct MailSlot {
    kind: u32,
    a: u32,
    b: u32,
    c: u32,
    d: u32,
    e: u32,
    f: u32,
    len: u32,
    data: [u8; MAIL_DATA],
}

/// Fixed-capacity ring embedded in each participant entry.
#[repr(C)]
pub(crate) struct MailRing {
    head: u32,
    count: u32,
    slots: [MailSlot; MAIL_SLOTS],
}

/// A decoded mailbox message (process-local form).
#[derive(Debug, Clone)]
pub(crate) enum Message {
    /// Deliver `payload` to the receiver's local reactions of `reactor`.
    Notification { reactor: SharedRef, payload: Vec<u8> },
    /// Run the handler of `call` for request `serial` from `caller`.
    CallRequest {
        call: SharedRef,
        serial: u32,
        caller: u32,
        flags: u32,
        arg: i32,
        payload: Vec<u8>,
    },
    /// Complete the blocking `execute` waiting on `serial`.
    CallReply { serial: u32, status: u32, value: i32 },
}

impl MailRing {
    /// Reset to empty. Called while the participant slot is being claimed.
    pub(crate) fn reset(&mut self) {
        self.head = 0;
        self.count = 0;
    }

    pub(crate) fn is_full(&self) -> bool {
        self.count as usize >= MAIL_SLOTS
    }

    /// Append a message. Caller holds the participant mutex.
    /// Returns `false` when the ring is full.
    pub(crate) fn push(&mut self, msg: &Message) -> bool {
        if self.is_full() {
            return false;
        }
        let idx = (self.head as usize + self.count as usize) % MAIL_SLOTS;
        let slot = &mut self.slots[idx];

        match msg {
            Message::Notification { reactor, payload } => {
                slot.kind = MSG_NOTIFICATION;
                slot.a = reactor.pool;
                slot.b = reactor.offset;
                slot.len = payload.len().min(MAIL_DATA) as u32;
                slot.data[..slot.len as usize].copy_from_slice(&payload[..slot.len as usize]);
            }
            Message::CallRequest {
                call,
                serial,
                caller,
                flags,
                arg,
                payload,
            } => {
                slot.kind = MSG_CALL_REQUEST;
                slot.a = call.pool;
                slot.b = call.offset;
                slot.c = *serial;
                slot.d = *caller;
                slot.e = *flags;
                slot.f = *arg as u32;
                slot.len = payload.len().min(MAIL_DATA) as u32;
                slot.data[..slot.len as usize].copy_from_slice(&payload[..slot.len as usize]);
            }
            Message::CallReply {
                serial,
                status,
                value,
            } => {
                slot.kind = MSG_CALL_REPLY;
                slot.c = *serial;
                slot.d = *status;
                slot.f = *value as u32;
                slot.len = 0;
            }
        }

        self.count += 1;
        true
    }

    /// Take the oldest message. Caller holds the participant mutex.
    pub(crate) fn pop(&mut self) -> Option<Message> {
        if self.count == 0 {
            return None;
        }
        let idx = self.head as usize;
        self.head = ((self.head as usize + 1) % MAIL_SLOTS) as u32;
        self.count -= 1;

        let slot = &self.slots[idx];
        let payload = slot.data[..slot.len.min(MAIL_DATA as u32) as usize].to_vec();

        match slot.kind {
            MSG_NOTIFICATION => Some(Message::Notification {
                reactor: SharedRef {
                    pool: slot.a,
                    offset: slot.b,
                },
                payload,
            }),
            MSG_CALL_REQUEST => Some(Message::CallRequest {
                call: SharedRef {
                    pool: slot.a,
                    offset: slot.b,
                },
                serial: slot.c,
                caller: slot.d,
                flags: slot.e,
                arg: slot.f as i32,
                payload,
            }),
            MSG_CALL_REPLY => Some(Message::CallReply {
                serial: slot.c,
                status: slot.d,
                value: slot.f as i32,
            }),
            other => {
                tracing::error!(kind = other, "corrupt mailbox slot, dropping");
                None
            }
        }
    }

    /// Drain every queued message. Caller holds the participant mutex.
    pub(crate) fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.count as usize);
        while self.count > 0 {
            if let Some(m) = self.pop() {
                out.push(m);
            }
        }
        out
    }
}
