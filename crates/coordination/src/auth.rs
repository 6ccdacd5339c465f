// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Principal records under `/users/<b64-principal>`: a salted password hash
//! per user. Principals are base64-encoded in the node name so arbitrary
//! user names cannot escape the path grammar.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::client::{CreateMode, CreatePolicy, SharedClient};
use crate::paths;
use crate::{Error, Result};

const SALT_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("user {0} already exists")]
    UserExists(String),
    #[error("user {0} does not exist")]
    NoSuchUser(String),
    #[error("bad credentials for user {0}")]
    BadCredentials(String),
    #[error(transparent)]
    Coordination(#[from] Error),
}

fn hash_password(password: &[u8], salt: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password);
    hasher.finalize().to_vec()
}

fn encode_record(password: &[u8]) -> Bytes {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut record = Vec::with_capacity(SALT_LEN + 32);
    record.extend_from_slice(&salt);
    record.extend_from_slice(&hash_password(password, &salt));
    Bytes::from(record)
}

fn verify_record(record: &[u8], password: &[u8]) -> bool {
    if record.len() <= SALT_LEN {
        return false;
    }
    let (salt, stored_hash) = record.split_at(SALT_LEN);
    hash_password(password, salt) == stored_hash
}

pub struct Authenticator {
    client: SharedClient,
}

impl Authenticator {
    pub fn new(client: SharedClient) -> Self {
        Authenticator { client }
    }

    fn user_path(principal: &str) -> String {
        paths::user(&URL_SAFE_NO_PAD.encode(principal))
    }

    pub async fn create_user(&self, principal: &str, password: &[u8]) -> Result<(), AuthError> {
        crate::memory::ensure_persistent_path(self.client.as_ref(), paths::USERS).await?;
        match self
            .client
            .create(
                &Self::user_path(principal),
                encode_record(password),
                CreateMode::Persistent,
                CreatePolicy::FailIfExists,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::AlreadyExists(_)) => Err(AuthError::UserExists(principal.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn drop_user(&self, principal: &str) -> Result<(), AuthError> {
        if !self.user_exists(principal).await? {
            return Err(AuthError::NoSuchUser(principal.to_string()));
        }
        self.client.delete(&Self::user_path(principal), None).await?;
        Ok(())
    }

    pub async fn user_exists(&self, principal: &str) -> Result<bool, AuthError> {
        Ok(self.client.exists(&Self::user_path(principal)).await?)
    }

    pub async fn authenticate(&self, principal: &str, password: &[u8]) -> Result<(), AuthError> {
        let record = self
            .client
            .try_get(&Self::user_path(principal))
            .await?
            .ok_or_else(|| AuthError::NoSuchUser(principal.to_string()))?;
        if verify_record(&record.data, password) {
            Ok(())
        } else {
            Err(AuthError::BadCredentials(principal.to_string()))
        }
    }

    pub async fn change_password(&self, principal: &str, password: &[u8]) -> Result<(), AuthError> {
        let path = Self::user_path(principal);
        if !self.client.exists(&path).await? {
            return Err(AuthError::NoSuchUser(principal.to_string()));
        }
        self.client.put(&path, encode_record(password), None).await?;
        Ok(())
    }

    pub async fn list_users(&self) -> Result<Vec<String>, AuthError> {
        let children = match self.client.get_children(paths::USERS).await {
            Ok(children) => children,
            Err(Error::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut users = Vec::with_capacity(children.len());
        for child in children {
            let decoded = URL_SAFE_NO_PAD
                .decode(&child)
                .map_err(|err| Error::Corrupt {
                    path: paths::user(&child),
                    reason: err.to_string(),
                })?;
            users.push(String::from_utf8_lossy(&decoded).into_owned());
        }
        Ok(users)
    }
}
