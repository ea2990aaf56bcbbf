use crate::error::{Error, Result};

/// Request side of the remote protocol. The u8 value is the wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RemoteMessageType {
    AllTerms = 0,
    CollFreq = 1,
    Document = 2,
    TermExists = 3,
    TermFreq = 4,
    ValueStats = 5,
    KeepAlive = 6,
    DocLength = 7,
    Query = 8,
    TermList = 9,
    PositionList = 10,
    PostList = 11,
    Reopen = 12,
    Update = 13,
    AddDocument = 14,
    Cancel = 15,
    DeleteDocumentTerm = 16,
    Commit = 17,
    ReplaceDocument = 18,
    ReplaceDocumentTerm = 19,
    DeleteDocument = 20,
    WriteAccess = 21,
    GetMetadata = 22,
    SetMetadata = 23,
    AddSpelling = 24,
    RemoveSpelling = 25,
    GetMSet = 26,
    Shutdown = 27,
    MetadataKeyList = 28,
    Freqs = 29,
    UniqueTerms = 30,
    ReadAccess = 31,
}

impl RemoteMessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::AllTerms => "ALLTERMS",
            Self::CollFreq => "COLLFREQ",
            Self::Document => "DOCUMENT",
            Self::TermExists => "TERMEXISTS",
            Self::TermFreq => "TERMFREQ",
            Self::ValueStats => "VALUESTATS",
            Self::KeepAlive => "KEEPALIVE",
            Self::DocLength => "DOCLENGTH",
            Self::Query => "QUERY",
            Self::TermList => "TERMLIST",
            Self::PositionList => "POSITIONLIST",
            Self::PostList => "POSTLIST",
            Self::Reopen => "REOPEN",
            Self::Update => "UPDATE",
            Self::AddDocument => "ADDDOCUMENT",
            Self::Cancel => "CANCEL",
            Self::DeleteDocumentTerm => "DELETEDOCUMENTTERM",
            Self::Commit => "COMMIT",
            Self::ReplaceDocument => "REPLACEDOCUMENT",
            Self::ReplaceDocumentTerm => "REPLACEDOCUMENTTERM",
            Self::DeleteDocument => "DELETEDOCUMENT",
            Self::WriteAccess => "WRITEACCESS",
            Self::GetMetadata => "GETMETADATA",
            Self::SetMetadata => "SETMETADATA",
            Self::AddSpelling => "ADDSPELLING",
            Self::RemoveSpelling => "REMOVESPELLING",
            Self::GetMSet => "GETMSET",
            Self::Shutdown => "SHUTDOWN",
            Self::MetadataKeyList => "METADATAKEYLIST",
            Self::Freqs => "FREQS",
            Self::UniqueTerms => "UNIQUETERMS",
            Self::ReadAccess => "READACCESS",
        }
    }
}

impl TryFrom<u8> for RemoteMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::AllTerms),
            1 => Ok(Self::CollFreq),
            2 => Ok(Self::Document),
            3 => Ok(Self::TermExists),
            4 => Ok(Self::TermFreq),
            5 => Ok(Self::ValueStats),
            6 => Ok(Self::KeepAlive),
            7 => Ok(Self::DocLength),
            8 => Ok(Self::Query),
            9 => Ok(Self::TermList),
            10 => Ok(Self::PositionList),
            11 => Ok(Self::PostList),
            12 => Ok(Self::Reopen),
            13 => Ok(Self::Update),
            14 => Ok(Self::AddDocument),
            15 => Ok(Self::Cancel),
            16 => Ok(Self::DeleteDocumentTerm),
            17 => Ok(Self::Commit),
            18 => Ok(Self::ReplaceDocument),
            19 => Ok(Self::ReplaceDocumentTerm),
            20 => Ok(Self::DeleteDocument),
            21 => Ok(Self::WriteAccess),
            22 => Ok(Self::GetMetadata),
            23 => Ok(Self::SetMetadata),
            24 => Ok(Self::AddSpelling),
            25 => Ok(Self::RemoveSpelling),
            26 => Ok(Self::GetMSet),
            27 => Ok(Self::Shutdown),
            28 => Ok(Self::MetadataKeyList),
            29 => Ok(Self::Freqs),
            30 => Ok(Self::UniqueTerms),
            31 => Ok(Self::ReadAccess),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

/// Reply side of the remote protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RemoteReplyType {
    Update = 0,
    Exception = 1,
    Done = 2,
    AllTerms = 3,
    CollFreq = 4,
    DocData = 5,
    TermDoesntExist = 6,
    TermExists = 7,
    TermFreq = 8,
    ValueStats = 9,
    DocLength = 10,
    Stats = 11,
    TermList = 12,
    PositionList = 13,
    PostListStart = 14,
    PostListItem = 15,
    Value = 16,
    AddDocument = 17,
    Results = 18,
    Metadata = 19,
    MetadataKeyList = 20,
    Freqs = 21,
    UniqueTerms = 22,
}

impl RemoteReplyType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for RemoteReplyType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Update),
            1 => Ok(Self::Exception),
            2 => Ok(Self::Done),
            3 => Ok(Self::AllTerms),
            4 => Ok(Self::CollFreq),
            5 => Ok(Self::DocData),
            6 => Ok(Self::TermDoesntExist),
            7 => Ok(Self::TermExists),
            8 => Ok(Self::TermFreq),
            9 => Ok(Self::ValueStats),
            10 => Ok(Self::DocLength),
            11 => Ok(Self::Stats),
            12 => Ok(Self::TermList),
            13 => Ok(Self::PositionList),
            14 => Ok(Self::PostListStart),
            15 => Ok(Self::PostListItem),
            16 => Ok(Self::Value),
            17 => Ok(Self::AddDocument),
            18 => Ok(Self::Results),
            19 => Ok(Self::Metadata),
            20 => Ok(Self::MetadataKeyList),
            21 => Ok(Self::Freqs),
            22 => Ok(Self::UniqueTerms),
            other => Err(Error::UnknownReplyType(other)),
        }
    }
}

/// Replication role sub-protocol. Codes live in a high band so the
/// first frame on a connection also selects the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplicationMessageType {
    Hello = 0xf0,
    Welcome = 0xf1,
    Need = 0xf2,
    Entry = 0xf3,
    Done = 0xf4,
}

impl ReplicationMessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ReplicationMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0xf0 => Ok(Self::Hello),
            0xf1 => Ok(Self::Welcome),
            0xf2 => Ok(Self::Need),
            0xf3 => Ok(Self::Entry),
            0xf4 => Ok(Self::Done),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}
