// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Layout of the coordination-service tree, relative to an instance root.

use tessera_types::{NamespaceId, TableId, TServerInstance};

pub const TABLES: &str = "/tables";
pub const NAMESPACES: &str = "/namespaces";
pub const CONFIG: &str = "/config";
pub const USERS: &str = "/users";
pub const FATE: &str = "/fate";
pub const LOCKS: &str = "/locks";
pub const MANAGER_LOCK: &str = "/locks/manager";
pub const TSERVER_LOCKS: &str = "/locks/tservers";
pub const WALS: &str = "/wals";
pub const PREPARE_FOR_UPGRADE: &str = "/prepare-for-upgrade";
pub const TABLE_LOCKS: &str = "/table-locks";
pub const ROOT_TABLET: &str = "/root-tablet";

pub fn table_conf(table: &TableId) -> String {
    format!("{TABLES}/{table}/conf")
}

pub fn table_state(table: &TableId) -> String {
    format!("{TABLES}/{table}/state")
}

pub fn namespace_conf(namespace: &NamespaceId) -> String {
    format!("{NAMESPACES}/{namespace}/conf")
}

pub fn user(principal_b64: &str) -> String {
    format!("{USERS}/{principal_b64}")
}

pub fn fate_txn(uuid: &uuid::Uuid) -> String {
    format!("{FATE}/{uuid}")
}

pub fn tserver_lock(server_host_port: &str) -> String {
    format!("{TSERVER_LOCKS}/{server_host_port}")
}

pub fn wals_for(server: &TServerInstance) -> String {
    format!("{WALS}/{}[{:x}]", server.host_port(), server.session())
}

pub fn table_lock(table: &TableId) -> String {
    format!("{TABLE_LOCKS}/{table}")
}
