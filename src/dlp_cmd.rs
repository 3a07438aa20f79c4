/*! Typed wrappers for the DLP requests a sync session actually makes.

Each wrapper packs its inputs into argument records of the layout the
device expects, runs one request/response exchange, and unpacks the
typed results. A nonzero DLP status comes back unchanged as
[`Error::Dlp`](crate::Error::Dlp) so callers can decide per command how
to react (`NotFound` at the end of a record walk is routine, for
example).
*/

use crate::conn::Connection;
use crate::dlp::DlpArg;
use crate::error::{ProtocolError, Result};
use crate::util::ensure_remaining;
use bytes::{Buf, BufMut};

/// Request ids.
pub mod cmd {
    pub const READ_USER_INFO: u8 = 0x10;
    pub const WRITE_USER_INFO: u8 = 0x11;
    pub const READ_SYS_INFO: u8 = 0x12;
    pub const GET_SYS_DATE_TIME: u8 = 0x13;
    pub const SET_SYS_DATE_TIME: u8 = 0x14;
    pub const READ_STORAGE_INFO: u8 = 0x15;
    pub const READ_DB_LIST: u8 = 0x16;
    pub const OPEN_DB: u8 = 0x17;
    pub const CREATE_DB: u8 = 0x18;
    pub const CLOSE_DB: u8 = 0x19;
    pub const DELETE_DB: u8 = 0x1a;
    pub const READ_APP_BLOCK: u8 = 0x1b;
    pub const WRITE_APP_BLOCK: u8 = 0x1c;
    pub const READ_SORT_BLOCK: u8 = 0x1d;
    pub const WRITE_SORT_BLOCK: u8 = 0x1e;
    pub const READ_NEXT_MODIFIED_REC: u8 = 0x1f;
    pub const READ_RECORD: u8 = 0x20;
    pub const WRITE_RECORD: u8 = 0x21;
    pub const DELETE_RECORD: u8 = 0x22;
    pub const READ_RESOURCE: u8 = 0x23;
    pub const WRITE_RESOURCE: u8 = 0x24;
    pub const DELETE_RESOURCE: u8 = 0x25;
    pub const CLEAN_UP_DATABASE: u8 = 0x26;
    pub const RESET_SYNC_FLAGS: u8 = 0x27;
    pub const CALL_APPLICATION: u8 = 0x28;
    pub const RESET_SYSTEM: u8 = 0x29;
    pub const ADD_SYNC_LOG_ENTRY: u8 = 0x2a;
    pub const READ_OPEN_DB_INFO: u8 = 0x2b;
    pub const MOVE_CATEGORY: u8 = 0x2c;
    pub const OPEN_CONDUIT: u8 = 0x2e;
    pub const END_OF_SYNC: u8 = 0x2f;
    pub const RESET_RECORD_INDEX: u8 = 0x30;
    pub const READ_RECORD_ID_LIST: u8 = 0x31;
    pub const READ_NEXT_REC_IN_CATEGORY: u8 = 0x32;
    pub const READ_NEXT_MODIFIED_REC_IN_CATEGORY: u8 = 0x33;
    pub const READ_APP_PREFERENCE: u8 = 0x34;
    pub const WRITE_APP_PREFERENCE: u8 = 0x35;
    pub const READ_NET_SYNC_INFO: u8 = 0x36;
    pub const WRITE_NET_SYNC_INFO: u8 = 0x37;
    pub const READ_FEATURE: u8 = 0x38;
}

/// Arguments and responses both number from here, one id per record.
const ARG_BASE: u16 = 0x20;

/// Max length of a database name, including the trailing NUL.
pub const DB_NAME_LEN: usize = 32;
/// Max length of a username, including the trailing NUL.
pub const USERNAME_LEN: usize = 41;
/// Max sync-log length, including the trailing NUL.
const MAX_LOG_LEN: usize = 2048;

/// Flags for [`Connection::open_db`].
pub mod open_mode {
    pub const READ: u8 = 0x80;
    pub const WRITE: u8 = 0x40;
    pub const EXCLUSIVE: u8 = 0x20;
    pub const SECRET: u8 = 0x10;
}

/// Search flags for [`Connection::read_db_list`], and the `MORE` bit in
/// the reply.
pub mod db_list {
    pub const RAM: u8 = 0x80;
    pub const ROM: u8 = 0x40;
    pub const MULTIPLE: u8 = 0x20;
    /// Set in [`DbList::flags`](super::DbList) when more entries remain.
    pub const MORE: u8 = 0x80;
}

/// Which-fields-changed bits for [`Connection::write_user_info`].
pub mod mod_flags {
    pub const USER_ID: u8 = 0x80;
    pub const SYNC_PC: u8 = 0x40;
    pub const SYNC_DATE: u8 = 0x20;
    pub const USERNAME: u8 = 0x10;
    pub const VIEWER_ID: u8 = 0x08;
}

/// Session outcomes for [`Connection::end_of_sync`].
pub mod sync_end {
    pub const NORMAL: u16 = 0;
    pub const OUT_OF_MEMORY: u16 = 1;
    pub const CANCELLED: u16 = 2;
    pub const OTHER: u16 = 3;
}

/// Flags for [`Connection::delete_record`]. Without either bit set, the
/// record named by the id argument is deleted.
pub mod del_rec {
    /// Ignore the record id and delete every record.
    pub const ALL: u8 = 0x80;
    /// The least significant byte of the record id is a category; delete
    /// every record in it.
    pub const CATEGORY: u8 = 0x40;
}

/// Flags for [`Connection::delete_resource`].
pub mod del_rsrc {
    /// Ignore the type and id and delete every resource.
    pub const ALL: u8 = 0x80;
}

/// Which-fields-changed bits for [`Connection::write_net_sync_info`].
pub mod net_sync_mod {
    pub const LAN_SYNC: u8 = 0x80;
    pub const HOSTNAME: u8 = 0x40;
    pub const HOST_ADDR: u8 = 0x20;
    pub const NETMASK: u8 = 0x10;
}

/// Flags and length sentinels for the app-preference calls.
pub mod pref {
    /// Ask [`Connection::read_app_preference`] for the whole preference.
    pub const READ_FULL: u16 = 0xffff;
    /// Address the backed-up preference database.
    pub const BACKED_UP: u8 = 0x80;
}

/// Pass as the length to [`Connection::read_resource_by_index`] to read
/// the entire resource.
pub const RESOURCE_TO_END: u16 = 0xffff;

/// A timestamp as the device keeps them: civil date and time, no zone.
/// A year of zero means "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DlpTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DlpTime {
    const WIRE_LEN: usize = 8;

    fn parse(buf: &mut &[u8]) -> DlpTime {
        let t = DlpTime {
            year: buf.get_u16(),
            month: buf.get_u8(),
            day: buf.get_u8(),
            hour: buf.get_u8(),
            minute: buf.get_u8(),
            second: buf.get_u8(),
        };
        buf.advance(1); // padding
        t
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.put_u16(self.year);
        out.put_u8(self.month);
        out.put_u8(self.day);
        out.put_u8(self.hour);
        out.put_u8(self.minute);
        out.put_u8(self.second);
        out.put_u8(0); // padding
    }
}

/// Who owns the handheld, per `ReadUserInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub userid: u32,
    pub viewerid: u32,
    pub last_sync_pc: u32,
    pub last_good_sync: DlpTime,
    pub last_sync: DlpTime,
    /// Username bytes, trailing NUL included, as stored on the device.
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

/// The fields `WriteUserInfo` can change. Only those whose bit is set in
/// `modflags` are touched by the device.
#[derive(Debug, Clone, Default)]
pub struct NewUserInfo {
    pub userid: u32,
    pub viewerid: u32,
    pub last_sync_pc: u32,
    pub last_sync: DlpTime,
    pub modflags: u8,
    /// Username bytes, trailing NUL included.
    pub username: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SysInfo {
    pub rom_version: u32,
    pub localization: u32,
    pub product_id_size: u8,
    pub product_id: u32,
    /// DLP protocol version, major/minor. Zero on pre-1.2 devices.
    pub dlp_ver_major: u16,
    pub dlp_ver_minor: u16,
    pub compat_ver_major: u16,
    pub compat_ver_minor: u16,
    pub max_record_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbInfo {
    pub misc_flags: u8,
    pub db_flags: u16,
    pub type_code: u32,
    pub creator: u32,
    pub version: u16,
    pub modnum: u32,
    pub ctime: DlpTime,
    pub mtime: DlpTime,
    pub baktime: DlpTime,
    pub index: u16,
    /// Database name, NUL stripped.
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbList {
    /// Index of the last entry returned; pass `last_index + 1` as the
    /// next start to page through.
    pub last_index: u16,
    /// Response flags; see [`db_list::MORE`].
    pub flags: u8,
    pub databases: Vec<DbInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordInfo {
    pub id: u32,
    pub index: u16,
    pub size: u16,
    pub attributes: u8,
    pub category: u8,
}

/// Information a database to be created is described by.
#[derive(Debug, Clone, Default)]
pub struct NewDatabase {
    pub creator: u32,
    pub type_code: u32,
    pub card: u8,
    pub flags: u16,
    pub version: u16,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    pub type_code: u32,
    pub id: u16,
    pub index: u16,
    pub size: u16,
}

/// One memory card, per `ReadStorageInfo`. Sizes are in bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardInfo {
    pub card_no: u8,
    pub card_version: u16,
    pub ctime: DlpTime,
    pub rom_size: u32,
    pub ram_size: u32,
    pub free_ram: u32,
    pub card_name: Vec<u8>,
    pub manufacturer: Vec<u8>,
    /// Database counts; zero on devices too old to report them.
    pub rom_dbs: u16,
    pub ram_dbs: u16,
}

/// Which application `CallApplication` should invoke.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppCall {
    pub creator: u32,
    /// Database type of the application. Ignored by PalmOS 1.x.
    pub type_code: u32,
    pub action: u16,
}

/// What the called application handed back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppResult {
    /// Action code echoed by PalmOS 1.x devices; zero under 2.x.
    pub action: u16,
    pub result: u32,
    pub data: Vec<u8>,
}

/// An application preference, as stored in the preference database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppPreference {
    pub version: u16,
    /// Full size of the preference on the device, which can exceed
    /// `data.len()` if the read was capped.
    pub size: u16,
    pub data: Vec<u8>,
}

/// The name and address of the host a handheld net-syncs with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetSyncInfo {
    pub lan_sync: u8,
    /// NUL-terminated bytes, as stored on the device.
    pub hostname: Vec<u8>,
    pub host_addr: Vec<u8>,
    pub netmask: Vec<u8>,
}

fn put_name(out: &mut Vec<u8>, name: &[u8], cap: usize) {
    let n = name.len().min(cap - 1);
    out.extend_from_slice(&name[..n]);
    out.put_u8(0);
}

fn required<'a>(resp: &crate::dlp::DlpResponse<'a>, id: u16) -> Result<DlpArg<'a>> {
    resp.arg(id).ok_or_else(|| ProtocolError::MissingArg(id).into())
}

impl Connection {
    /// `ReadUserInfo`: who owns this handheld, and when it last synced.
    pub fn read_user_info(&mut self) -> Result<UserInfo> {
        let resp = self.dlp_request(cmd::READ_USER_INFO, &[])?.checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 12 + 2 * DlpTime::WIRE_LEN + 2);
        let mut info = UserInfo {
            userid: b.get_u32(),
            viewerid: b.get_u32(),
            last_sync_pc: b.get_u32(),
            last_good_sync: DlpTime::parse(&mut b),
            last_sync: DlpTime::parse(&mut b),
            ..UserInfo::default()
        };
        let username_len = b.get_u8() as usize;
        let password_len = b.get_u8() as usize;
        ensure_remaining!(b, username_len + password_len);
        info.username = b[..username_len].to_vec();
        b.advance(username_len);
        info.password = b[..password_len].to_vec();
        Ok(info)
    }

    /// `WriteUserInfo`: change the fields whose bits are set in
    /// `info.modflags`.
    pub fn write_user_info(&mut self, info: &NewUserInfo) -> Result<()> {
        let mut buf = Vec::with_capacity(22 + USERNAME_LEN);
        buf.put_u32(info.userid);
        buf.put_u32(info.viewerid);
        buf.put_u32(info.last_sync_pc);
        info.last_sync.encode(&mut buf);
        buf.put_u8(info.modflags);
        let n = info.username.len().min(USERNAME_LEN);
        buf.put_u8(n as u8);
        buf.extend_from_slice(&info.username[..n]);
        self.dlp_request(
            cmd::WRITE_USER_INFO,
            &[DlpArg { id: ARG_BASE, data: &buf }],
        )?
        .checked()?;
        Ok(())
    }

    /// `ReadSysInfo`: ROM version and friends. The DLP-version fields
    /// stay zero on devices too old to report them.
    pub fn read_sys_info(&mut self) -> Result<SysInfo> {
        let resp = self.dlp_request(cmd::READ_SYS_INFO, &[])?.checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 14);
        let mut info = SysInfo {
            rom_version: b.get_u32(),
            localization: b.get_u32(),
            ..SysInfo::default()
        };
        b.advance(1); // padding
        info.product_id_size = b.get_u8();
        info.product_id = b.get_u32();

        if let Some(arg) = resp.arg(ARG_BASE + 1) {
            let mut b = arg.data;
            ensure_remaining!(b, 12);
            info.dlp_ver_major = b.get_u16();
            info.dlp_ver_minor = b.get_u16();
            info.compat_ver_major = b.get_u16();
            info.compat_ver_minor = b.get_u16();
            info.max_record_size = b.get_u32();
        }
        Ok(info)
    }

    /// `GetSysDateTime`: the handheld's clock.
    pub fn get_sys_date_time(&mut self) -> Result<DlpTime> {
        let resp = self.dlp_request(cmd::GET_SYS_DATE_TIME, &[])?.checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, DlpTime::WIRE_LEN);
        Ok(DlpTime::parse(&mut b))
    }

    /// `SetSysDateTime`: set the handheld's clock.
    pub fn set_sys_date_time(&mut self, time: &DlpTime) -> Result<()> {
        let mut buf = Vec::with_capacity(DlpTime::WIRE_LEN);
        time.encode(&mut buf);
        self.dlp_request(
            cmd::SET_SYS_DATE_TIME,
            &[DlpArg { id: ARG_BASE, data: &buf }],
        )?
        .checked()?;
        Ok(())
    }

    /// `ReadDBList`: one page of the database directory, starting at
    /// `start`.
    pub fn read_db_list(&mut self, flags: u8, card: u8, start: u16) -> Result<DbList> {
        let mut buf = Vec::with_capacity(4);
        buf.put_u8(flags);
        buf.put_u8(card);
        buf.put_u16(start);
        let resp = self
            .dlp_request(cmd::READ_DB_LIST, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 4);
        let mut list = DbList {
            last_index: b.get_u16(),
            flags: b.get_u8(),
            databases: Vec::new(),
        };
        let count = b.get_u8();
        for _ in 0..count {
            ensure_remaining!(b, 44);
            let entry_len = b[0] as usize;
            b.advance(1); // the entry length itself
            let mut db = DbInfo {
                misc_flags: b.get_u8(),
                db_flags: b.get_u16(),
                type_code: b.get_u32(),
                creator: b.get_u32(),
                version: b.get_u16(),
                modnum: b.get_u32(),
                ctime: DlpTime::parse(&mut b),
                mtime: DlpTime::parse(&mut b),
                baktime: DlpTime::parse(&mut b),
                index: b.get_u16(),
                name: Vec::new(),
            };
            // The name fills the rest of the entry, NUL-terminated
            let name_len = entry_len.saturating_sub(44).min(b.remaining()).min(DB_NAME_LEN);
            let name = &b[..name_len];
            let end = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            db.name = name[..end].to_vec();
            b.advance(name_len);
            list.databases.push(db);
        }
        Ok(list)
    }

    /// `OpenDB`: open a database by name; returns its handle.
    pub fn open_db(&mut self, card: u8, name: &[u8], mode: u8) -> Result<u8> {
        let mut buf = Vec::with_capacity(2 + DB_NAME_LEN);
        buf.put_u8(card);
        buf.put_u8(mode);
        put_name(&mut buf, name, DB_NAME_LEN);
        let resp = self
            .dlp_request(cmd::OPEN_DB, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 1);
        Ok(b.get_u8())
    }

    /// `CreateDB`: create a database; returns the handle of the newly
    /// created (and open) database.
    pub fn create_db(&mut self, db: &NewDatabase) -> Result<u8> {
        let mut buf = Vec::with_capacity(14 + DB_NAME_LEN);
        buf.put_u32(db.creator);
        buf.put_u32(db.type_code);
        buf.put_u8(db.card);
        buf.put_u8(0); // padding
        buf.put_u16(db.flags);
        buf.put_u16(db.version);
        put_name(&mut buf, &db.name, DB_NAME_LEN);
        let resp = self
            .dlp_request(cmd::CREATE_DB, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 1);
        Ok(b.get_u8())
    }

    /// `CloseDB`: close one open database.
    pub fn close_db(&mut self, handle: u8) -> Result<()> {
        self.dlp_request(cmd::CLOSE_DB, &[DlpArg { id: ARG_BASE, data: &[handle] }])?
            .checked()?;
        Ok(())
    }

    /// `CloseDB`: close every open database.
    pub fn close_all_dbs(&mut self) -> Result<()> {
        self.dlp_request(cmd::CLOSE_DB, &[DlpArg { id: ARG_BASE + 1, data: &[] }])?
            .checked()?;
        Ok(())
    }

    /// `DeleteDB`: delete a (closed) database by name.
    pub fn delete_db(&mut self, card: u8, name: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(2 + DB_NAME_LEN);
        buf.put_u8(card);
        buf.put_u8(0); // padding
        put_name(&mut buf, name, DB_NAME_LEN);
        self.dlp_request(cmd::DELETE_DB, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        Ok(())
    }

    /// `ReadAppBlock`: up to `len` bytes of a database's AppInfo block,
    /// from `offset`.
    pub fn read_app_block(&mut self, handle: u8, offset: u16, len: u16) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(6);
        buf.put_u8(handle);
        buf.put_u8(0); // padding
        buf.put_u16(offset);
        buf.put_u16(len);
        let resp = self
            .dlp_request(cmd::READ_APP_BLOCK, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 2);
        let size = b.get_u16() as usize;
        ensure_remaining!(b, size);
        Ok(b[..size].to_vec())
    }

    /// `WriteAppBlock`: replace a database's AppInfo block.
    pub fn write_app_block(&mut self, handle: u8, data: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(4 + data.len());
        buf.put_u8(handle);
        buf.put_u8(0); // unused
        buf.put_u16(data.len() as u16);
        buf.extend_from_slice(data);
        self.dlp_request(cmd::WRITE_APP_BLOCK, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        Ok(())
    }

    /// `ReadNextModifiedRec`: the next record modified since the last
    /// sync. `Err(Dlp(NotFound))` when the walk is done.
    pub fn read_next_modified_rec(&mut self, handle: u8) -> Result<(RecordInfo, Vec<u8>)> {
        let resp = self
            .dlp_request(
                cmd::READ_NEXT_MODIFIED_REC,
                &[DlpArg { id: ARG_BASE, data: &[handle] }],
            )?
            .checked()?;
        parse_record_arg(&resp)
    }

    /// `ReadRecord` by record id.
    pub fn read_record_by_id(
        &mut self,
        handle: u8,
        id: u32,
        offset: u16,
        len: u16,
    ) -> Result<(RecordInfo, Vec<u8>)> {
        let mut buf = Vec::with_capacity(10);
        buf.put_u8(handle);
        buf.put_u8(0); // padding
        buf.put_u32(id);
        buf.put_u16(offset);
        buf.put_u16(len);
        let resp = self
            .dlp_request(cmd::READ_RECORD, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        parse_record_arg(&resp)
    }

    /// `ReadRecord` by index. The device only returns the record's info
    /// here; read the data with [`Connection::read_record_by_id`].
    pub fn read_record_by_index(&mut self, handle: u8, index: u16) -> Result<RecordInfo> {
        let mut buf = Vec::with_capacity(8);
        buf.put_u8(handle);
        buf.put_u8(0); // padding
        buf.put_u16(index);
        buf.put_u16(0); // offset, unused
        buf.put_u16(0); // len, unused
        let resp = self
            .dlp_request(cmd::READ_RECORD, &[DlpArg { id: ARG_BASE + 1, data: &buf }])?
            .checked()?;
        Ok(parse_record_arg(&resp)?.0)
    }

    /// `WriteRecord`: write one record; returns the record id the device
    /// assigned (the one passed in, unless it was zero).
    pub fn write_record(
        &mut self,
        handle: u8,
        id: u32,
        attributes: u8,
        category: u8,
        data: &[u8],
    ) -> Result<u32> {
        let mut buf = Vec::with_capacity(8 + data.len());
        buf.put_u8(handle);
        // The device insists on the high flag bit
        buf.put_u8(0x80);
        buf.put_u32(id);
        buf.put_u8(attributes);
        buf.put_u8(category);
        buf.extend_from_slice(data);
        let resp = self
            .dlp_request(cmd::WRITE_RECORD, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 4);
        Ok(b.get_u32())
    }

    /// `DeleteRecord`: delete the record with the given id, or, with the
    /// right [`del_rec`] flag, every record or a whole category.
    pub fn delete_record(&mut self, handle: u8, flags: u8, id: u32) -> Result<()> {
        let mut buf = Vec::with_capacity(6);
        buf.put_u8(handle);
        buf.put_u8(flags);
        buf.put_u32(id);
        self.dlp_request(cmd::DELETE_RECORD, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        Ok(())
    }

    /// `ReadRecordIDList`: ids of up to `max` records, starting at
    /// `start`. Devices cap one reply around 500 ids, so loop until you
    /// have them all.
    pub fn read_record_id_list(
        &mut self,
        handle: u8,
        flags: u8,
        start: u16,
        max: u16,
    ) -> Result<Vec<u32>> {
        let mut buf = Vec::with_capacity(6);
        buf.put_u8(handle);
        buf.put_u8(flags);
        buf.put_u16(start);
        buf.put_u16(max);
        let resp = self
            .dlp_request(
                cmd::READ_RECORD_ID_LIST,
                &[DlpArg { id: ARG_BASE, data: &buf }],
            )?
            .checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 2);
        let count = b.get_u16() as usize;
        ensure_remaining!(b, count * 4);
        Ok((0..count).map(|_| b.get_u32()).collect())
    }

    /// `OpenConduit`: tell the device a conduit is about to run.
    pub fn open_conduit(&mut self) -> Result<()> {
        self.dlp_request(cmd::OPEN_CONDUIT, &[])?.checked()?;
        Ok(())
    }

    /// `AddSyncLogEntry`: append to the log the user sees after a sync.
    /// Over-long messages keep their tail; that's where the errors are.
    pub fn add_sync_log_entry(&mut self, msg: &[u8]) -> Result<()> {
        if msg.is_empty() {
            return Ok(());
        }
        let tail = if msg.len() > MAX_LOG_LEN - 1 {
            &msg[msg.len() - (MAX_LOG_LEN - 1)..]
        } else {
            msg
        };
        let mut buf = Vec::with_capacity(tail.len() + 1);
        buf.extend_from_slice(tail);
        buf.put_u8(0);
        self.dlp_request(
            cmd::ADD_SYNC_LOG_ENTRY,
            &[DlpArg { id: ARG_BASE, data: &buf }],
        )?
        .checked()?;
        Ok(())
    }

    /// `ResetSystem`: reboot the device when the sync ends.
    pub fn reset_system(&mut self) -> Result<()> {
        self.dlp_request(cmd::RESET_SYSTEM, &[])?.checked()?;
        Ok(())
    }

    /// `EndOfSync`: finish the session. `status` is one of
    /// [`sync_end`]'s values.
    pub fn end_of_sync(&mut self, status: u16) -> Result<()> {
        let mut buf = Vec::with_capacity(2);
        buf.put_u16(status);
        self.dlp_request(cmd::END_OF_SYNC, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        Ok(())
    }

    /// `ReadStorageInfo`: memory card details. Devices claim more cards
    /// are pending but never actually return them, so one call tells the
    /// whole story.
    pub fn read_storage_info(&mut self, card: u8) -> Result<CardInfo> {
        let mut buf = Vec::with_capacity(2);
        buf.put_u8(card);
        buf.put_u8(0); // padding
        let resp = self
            .dlp_request(
                cmd::READ_STORAGE_INFO,
                &[DlpArg { id: ARG_BASE, data: &buf }],
            )?
            .checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 4 + 4 + DlpTime::WIRE_LEN + 14);
        b.advance(3); // last card, "more", padding
        let _act_count = b.get_u8();
        b.advance(1); // rounded-up total size of this entry
        let mut info = CardInfo {
            card_no: b.get_u8(),
            card_version: b.get_u16(),
            ctime: DlpTime::parse(&mut b),
            rom_size: b.get_u32(),
            ram_size: b.get_u32(),
            free_ram: b.get_u32(),
            ..CardInfo::default()
        };
        let card_name_len = b.get_u8() as usize;
        let manufacturer_len = b.get_u8() as usize;
        ensure_remaining!(b, card_name_len + manufacturer_len);
        info.card_name = b[..card_name_len].to_vec();
        b.advance(card_name_len);
        info.manufacturer = b[..manufacturer_len].to_vec();

        if let Some(arg) = resp.arg(ARG_BASE + 1) {
            let mut b = arg.data;
            ensure_remaining!(b, 4);
            info.rom_dbs = b.get_u16();
            info.ram_dbs = b.get_u16();
        }
        Ok(info)
    }

    /// `ReadSortBlock`: up to `len` bytes of a database's sort block,
    /// from `offset`.
    pub fn read_sort_block(&mut self, handle: u8, offset: u16, len: u16) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(6);
        buf.put_u8(handle);
        buf.put_u8(0); // padding
        buf.put_u16(offset);
        buf.put_u16(len);
        let resp = self
            .dlp_request(cmd::READ_SORT_BLOCK, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 2);
        let size = b.get_u16() as usize;
        ensure_remaining!(b, size);
        Ok(b[..size].to_vec())
    }

    /// `WriteSortBlock`: replace a database's sort block.
    pub fn write_sort_block(&mut self, handle: u8, data: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(4 + data.len());
        buf.put_u8(handle);
        buf.put_u8(0); // unused
        buf.put_u16(data.len() as u16);
        buf.extend_from_slice(data);
        self.dlp_request(cmd::WRITE_SORT_BLOCK, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        Ok(())
    }

    /// `ReadResource` by index. Pass [`RESOURCE_TO_END`] as `len` for the
    /// whole resource.
    pub fn read_resource_by_index(
        &mut self,
        handle: u8,
        index: u16,
        offset: u16,
        len: u16,
    ) -> Result<(ResourceInfo, Vec<u8>)> {
        let mut buf = Vec::with_capacity(8);
        buf.put_u8(handle);
        buf.put_u8(0); // padding
        buf.put_u16(index);
        buf.put_u16(offset);
        buf.put_u16(len);
        let resp = self
            .dlp_request(cmd::READ_RESOURCE, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 10);
        let info = ResourceInfo {
            type_code: b.get_u32(),
            id: b.get_u16(),
            index: b.get_u16(),
            size: b.get_u16(),
        };
        Ok((info, b.to_vec()))
    }

    /// `WriteResource`: write one resource.
    pub fn write_resource(
        &mut self,
        handle: u8,
        type_code: u32,
        id: u16,
        data: &[u8],
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(10 + data.len());
        buf.put_u8(handle);
        buf.put_u8(0); // padding
        buf.put_u32(type_code);
        buf.put_u16(id);
        buf.put_u16(data.len() as u16);
        buf.extend_from_slice(data);
        self.dlp_request(cmd::WRITE_RESOURCE, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        Ok(())
    }

    /// `DeleteResource`: delete one resource by type and id, or all of
    /// them with [`del_rsrc::ALL`].
    pub fn delete_resource(
        &mut self,
        handle: u8,
        flags: u8,
        type_code: u32,
        id: u16,
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(8);
        buf.put_u8(handle);
        buf.put_u8(flags);
        buf.put_u32(type_code);
        buf.put_u16(id);
        self.dlp_request(cmd::DELETE_RESOURCE, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        Ok(())
    }

    /// `CleanUpDatabase`: purge records marked deleted or archived.
    pub fn clean_up_database(&mut self, handle: u8) -> Result<()> {
        self.dlp_request(
            cmd::CLEAN_UP_DATABASE,
            &[DlpArg { id: ARG_BASE, data: &[handle] }],
        )?
        .checked()?;
        Ok(())
    }

    /// `ResetSyncFlags`: clear the dirty flags on every record.
    pub fn reset_sync_flags(&mut self, handle: u8) -> Result<()> {
        self.dlp_request(
            cmd::RESET_SYNC_FLAGS,
            &[DlpArg { id: ARG_BASE, data: &[handle] }],
        )?
        .checked()?;
        Ok(())
    }

    /// `CallApplication`: run an application on the device and collect
    /// its result. `rom_version` (from [`Connection::read_sys_info`])
    /// picks between the 1.x and 2.x request forms.
    pub fn call_application(
        &mut self,
        rom_version: u32,
        call: &AppCall,
        param: &[u8],
    ) -> Result<AppResult> {
        let v1 = rom_version < 0x0200_0000;
        let (arg_id, mut buf) = if v1 {
            let mut buf = Vec::with_capacity(8 + param.len());
            buf.put_u32(call.creator);
            buf.put_u16(call.action);
            buf.put_u16(param.len() as u16);
            (ARG_BASE, buf)
        } else {
            let mut buf = Vec::with_capacity(22 + param.len());
            buf.put_u32(call.creator);
            buf.put_u32(call.type_code);
            buf.put_u16(call.action);
            buf.put_u32(param.len() as u32);
            buf.put_u32(0); // reserved
            buf.put_u32(0); // reserved
            (ARG_BASE + 1, buf)
        };
        buf.extend_from_slice(param);
        let resp = self
            .dlp_request(cmd::CALL_APPLICATION, &[DlpArg { id: arg_id, data: &buf }])?
            .checked()?;

        if let Some(arg) = resp.arg(ARG_BASE) {
            // PalmOS 1.x reply
            let mut b = arg.data;
            ensure_remaining!(b, 6);
            let action = b.get_u16();
            let result = u32::from(b.get_u16());
            let size = b.get_u16() as usize;
            ensure_remaining!(b, size);
            return Ok(AppResult {
                action,
                result,
                data: b[..size].to_vec(),
            });
        }
        let arg = required(&resp, ARG_BASE + 1)?;
        let mut b = arg.data;
        ensure_remaining!(b, 16);
        let result = b.get_u32();
        let size = b.get_u32() as usize;
        b.advance(8); // reserved
        ensure_remaining!(b, size);
        Ok(AppResult {
            action: 0,
            result,
            data: b[..size].to_vec(),
        })
    }

    /// `ReadOpenDBInfo`: how many records an open database holds.
    pub fn read_open_db_info(&mut self, handle: u8) -> Result<u16> {
        let resp = self
            .dlp_request(
                cmd::READ_OPEN_DB_INFO,
                &[DlpArg { id: ARG_BASE, data: &[handle] }],
            )?
            .checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 2);
        Ok(b.get_u16())
    }

    /// `MoveCategory`: move every record in category `from` to `to`.
    pub fn move_category(&mut self, handle: u8, from: u8, to: u8) -> Result<()> {
        let buf = [handle, from, to, 0];
        self.dlp_request(cmd::MOVE_CATEGORY, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        Ok(())
    }

    /// `ResetRecordIndex`: restart the modified-record walk from the
    /// beginning.
    pub fn reset_record_index(&mut self, handle: u8) -> Result<()> {
        self.dlp_request(
            cmd::RESET_RECORD_INDEX,
            &[DlpArg { id: ARG_BASE, data: &[handle] }],
        )?
        .checked()?;
        Ok(())
    }

    /// `ReadNextRecInCategory`: the next record in the given category.
    /// `Err(Dlp(NotFound))` when the walk is done.
    pub fn read_next_rec_in_category(
        &mut self,
        handle: u8,
        category: u8,
    ) -> Result<(RecordInfo, Vec<u8>)> {
        let buf = [handle, category];
        let resp = self
            .dlp_request(
                cmd::READ_NEXT_REC_IN_CATEGORY,
                &[DlpArg { id: ARG_BASE, data: &buf }],
            )?
            .checked()?;
        parse_record_arg(&resp)
    }

    /// `ReadNextModifiedRecInCategory`: the next modified record in the
    /// given category. `Err(Dlp(NotFound))` when the walk is done.
    pub fn read_next_modified_rec_in_category(
        &mut self,
        handle: u8,
        category: u8,
    ) -> Result<(RecordInfo, Vec<u8>)> {
        let buf = [handle, category];
        let resp = self
            .dlp_request(
                cmd::READ_NEXT_MODIFIED_REC_IN_CATEGORY,
                &[DlpArg { id: ARG_BASE, data: &buf }],
            )?
            .checked()?;
        parse_record_arg(&resp)
    }

    /// `ReadAppPreference`: read an application preference. `len` caps
    /// the returned data; [`pref::READ_FULL`] reads all of it.
    pub fn read_app_preference(
        &mut self,
        creator: u32,
        id: u16,
        len: u16,
        flags: u8,
    ) -> Result<AppPreference> {
        let mut buf = Vec::with_capacity(10);
        buf.put_u32(creator);
        buf.put_u16(id);
        buf.put_u16(len);
        buf.put_u8(flags);
        buf.put_u8(0); // padding
        let resp = self
            .dlp_request(
                cmd::READ_APP_PREFERENCE,
                &[DlpArg { id: ARG_BASE, data: &buf }],
            )?
            .checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 6);
        let version = b.get_u16();
        let size = b.get_u16();
        let returned = b.get_u16() as usize;
        ensure_remaining!(b, returned);
        Ok(AppPreference {
            version,
            size,
            data: b[..returned].to_vec(),
        })
    }

    /// `WriteAppPreference`: write an application preference.
    pub fn write_app_preference(
        &mut self,
        creator: u32,
        id: u16,
        flags: u8,
        version: u16,
        data: &[u8],
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(12 + data.len());
        buf.put_u32(creator);
        buf.put_u16(id);
        buf.put_u16(version);
        buf.put_u16(data.len() as u16);
        buf.put_u8(flags);
        buf.put_u8(0); // padding
        buf.extend_from_slice(data);
        self.dlp_request(
            cmd::WRITE_APP_PREFERENCE,
            &[DlpArg { id: ARG_BASE, data: &buf }],
        )?
        .checked()?;
        Ok(())
    }

    /// `ReadNetSyncInfo`: which host this handheld net-syncs with.
    pub fn read_net_sync_info(&mut self) -> Result<NetSyncInfo> {
        let resp = self.dlp_request(cmd::READ_NET_SYNC_INFO, &[])?.checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 24);
        let lan_sync = b.get_u8();
        b.advance(17); // reserved
        let hostname_len = b.get_u16() as usize;
        let host_addr_len = b.get_u16() as usize;
        let netmask_len = b.get_u16() as usize;
        ensure_remaining!(b, hostname_len + host_addr_len + netmask_len);
        let mut info = NetSyncInfo {
            lan_sync,
            ..NetSyncInfo::default()
        };
        info.hostname = b[..hostname_len].to_vec();
        b.advance(hostname_len);
        info.host_addr = b[..host_addr_len].to_vec();
        b.advance(host_addr_len);
        info.netmask = b[..netmask_len].to_vec();
        Ok(info)
    }

    /// `WriteNetSyncInfo`: change the net-sync host fields whose bits are
    /// set in `modflags` (see [`net_sync_mod`]). String fields carry
    /// their trailing NUL.
    pub fn write_net_sync_info(&mut self, modflags: u8, info: &NetSyncInfo) -> Result<()> {
        let mut buf = Vec::with_capacity(
            24 + info.hostname.len() + info.host_addr.len() + info.netmask.len(),
        );
        buf.put_u8(modflags);
        buf.put_u8(info.lan_sync);
        buf.put_u32(0); // reserved
        buf.put_u32(0); // reserved
        buf.put_u32(0); // reserved
        buf.put_u32(0); // reserved
        buf.put_u16(info.hostname.len() as u16);
        buf.put_u16(info.host_addr.len() as u16);
        buf.put_u16(info.netmask.len() as u16);
        buf.extend_from_slice(&info.hostname);
        buf.extend_from_slice(&info.host_addr);
        buf.extend_from_slice(&info.netmask);
        self.dlp_request(
            cmd::WRITE_NET_SYNC_INFO,
            &[DlpArg { id: ARG_BASE, data: &buf }],
        )?
        .checked()?;
        Ok(())
    }

    /// `ReadFeature`: the value of a system feature register.
    pub fn read_feature(&mut self, creator: u32, feature: u16) -> Result<u32> {
        let mut buf = Vec::with_capacity(6);
        buf.put_u32(creator);
        buf.put_u16(feature);
        let resp = self
            .dlp_request(cmd::READ_FEATURE, &[DlpArg { id: ARG_BASE, data: &buf }])?
            .checked()?;
        let arg = required(&resp, ARG_BASE)?;
        let mut b = arg.data;
        ensure_remaining!(b, 4);
        Ok(b.get_u32())
    }
}

/// Record info followed by record data, as `ReadRecord` and friends
/// return it.
fn parse_record_arg(resp: &crate::dlp::DlpResponse<'_>) -> Result<(RecordInfo, Vec<u8>)> {
    let arg = required(resp, ARG_BASE)?;
    let mut b = arg.data;
    ensure_remaining!(b, 10);
    let info = RecordInfo {
        id: b.get_u32(),
        index: b.get_u16(),
        size: b.get_u16(),
        attributes: b.get_u8(),
        category: b.get_u8(),
    };
    Ok((info, b.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlp_time_wire_layout() {
        let t = DlpTime {
            year: 2024,
            month: 1,
            day: 15,
            hour: 10,
            minute: 30,
            second: 45,
        };
        let mut buf = Vec::new();
        t.encode(&mut buf);
        assert_eq!(buf, [0x07, 0xe8, 1, 15, 10, 30, 45, 0]);
        let mut b = &buf[..];
        assert_eq!(DlpTime::parse(&mut b), t);
    }

    #[test]
    fn name_fields_are_nul_terminated_and_capped() {
        let mut buf = Vec::new();
        put_name(&mut buf, b"MemoDB", DB_NAME_LEN);
        assert_eq!(buf, b"MemoDB\0");

        let mut buf = Vec::new();
        put_name(&mut buf, &[b'x'; 100], DB_NAME_LEN);
        assert_eq!(buf.len(), DB_NAME_LEN);
        assert_eq!(buf[DB_NAME_LEN - 1], 0);
    }
}
