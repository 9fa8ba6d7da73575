//! TripGate: 旅行代理店向けポータルの認証バックエンド
//!
//! パスワード + ワンタイムコード（OTP）の二段階サインインと、
//! サインイン後のアイドルセッション監視を提供する。

pub mod config;
pub mod error;
pub mod handlers;
pub mod idle;
pub mod models;
pub mod repositories;
pub mod services;
pub mod state;
